use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;

use crate::utils::error::{AppError, AppResult};

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder regex");
}

/// Flat key/value lookup table used to render command templates.
///
/// Values are merged layer by layer; a key set by a later layer replaces
/// the value from any earlier layer.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    values: BTreeMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one layer on top of the current values
    pub fn layer<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in entries {
            self.values.insert(key.into(), value.into());
        }
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Substitute every `{{ key }}` placeholder in `template`.
    ///
    /// Unknown keys and stray `{{` openers are errors.
    pub fn render(&self, template: &str) -> AppResult<String> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(template) {
            let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
            check_literal(&template[last..whole.start], template)?;
            out.push_str(&template[last..whole.start]);

            let key = &caps[1];
            let value = self.values.get(key).ok_or_else(|| {
                AppError::TemplateError(format!("unknown variable `{}` in `{}`", key, template))
            })?;
            out.push_str(value);
            last = whole.end;
        }
        check_literal(&template[last..], template)?;
        out.push_str(&template[last..]);
        Ok(out)
    }
}

fn check_literal(segment: &str, template: &str) -> AppResult<()> {
    if segment.contains("{{") {
        return Err(AppError::TemplateError(format!(
            "malformed placeholder in `{}`",
            template
        )));
    }
    Ok(())
}
