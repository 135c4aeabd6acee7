use log::warn;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use crate::models::capture_info::{CaptureInfo, InfoErrors};
use crate::models::tags::expand_tag_expressions;
use crate::utils::error::{AppError, AppResult};

/// Search root and filter criteria as written in the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinderSpec {
    /// Unique identifier for this finder
    pub id: String,

    /// Directory searched for captures; `~` is expanded
    pub directory: String,

    /// Id of the modifier applied to matched captures
    pub modifier: String,

    /// Glob patterns matched against the relative path or tag name
    pub patterns: Vec<String>,

    /// Tag expressions; requires a `tags.json` manifest in the directory
    pub tags: Vec<String>,

    /// Maximum average packet rate, 0 disables
    pub pps_le: f64,

    /// Minimum average packet rate, 0 disables
    pub pps_ge: f64,

    /// Maximum number of packets, 0 disables
    pub packet_count_le: i64,

    /// Minimum number of packets, 0 disables
    pub packet_count_ge: i64,

    /// Maximum average packet size, 0 disables
    pub avg_packet_size_le: f64,

    /// Minimum average packet size, 0 disables
    pub avg_packet_size_ge: f64,

    /// Only keep captures carrying IPv6 traffic
    pub only_ipv6: bool,

    /// Only keep Ethernet captures
    pub only_ethernet: bool,

    /// Read filter a capture must leave packets behind for
    pub read_filter: Option<String>,
}

impl Default for FinderSpec {
    fn default() -> Self {
        Self {
            id: String::new(),
            directory: String::new(),
            modifier: "default".to_string(),
            patterns: Vec::new(),
            tags: Vec::new(),
            pps_le: 0.0,
            pps_ge: 0.0,
            packet_count_le: 0,
            packet_count_ge: 0,
            avg_packet_size_le: 0.0,
            avg_packet_size_ge: 0.0,
            only_ipv6: false,
            only_ethernet: true,
            read_filter: None,
        }
    }
}

/// An optional inclusive range; unset ends are `None`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Bounds<T> {
    pub le: Option<T>,
    pub ge: Option<T>,
}

impl<T> Bounds<T>
where
    T: Copy + PartialOrd + Default + fmt::Display,
{
    /// Build from raw config values, where zero means unset
    pub fn new(name: &str, le: T, ge: T) -> AppResult<Self> {
        let zero = T::default();
        if le < zero {
            return Err(AppError::ConfigError(format!("{}_le must be >= 0", name)));
        }
        if ge < zero {
            return Err(AppError::ConfigError(format!("{}_ge must be >= 0", name)));
        }
        if le > zero && ge > zero && ge < le {
            return Err(AppError::ConfigError(format!(
                "{}_ge ({}) can not be less than {}_le ({})",
                name, ge, name, le
            )));
        }
        let set = |v: T| if v > zero { Some(v) } else { None };
        Ok(Self {
            le: set(le),
            ge: set(ge),
        })
    }

    pub fn is_set(&self) -> bool {
        self.le.is_some() || self.ge.is_some()
    }

    /// Why `value` falls outside the range, if it does
    pub fn violation(&self, label: &str, value: T) -> Option<String> {
        if let Some(le) = self.le {
            if value > le {
                return Some(format!("{} {} greater than limit {}", label, value, le));
            }
        }
        if let Some(ge) = self.ge {
            if value < ge {
                return Some(format!("{} {} less than limit {}", label, value, ge));
            }
        }
        None
    }
}

/// Compiled predicates of one finder
#[derive(Debug, Clone)]
pub struct FilterRules {
    pub patterns: Vec<Regex>,
    pub tag_combos: Vec<BTreeSet<String>>,
    pub pps: Bounds<f64>,
    pub packet_count: Bounds<i64>,
    pub avg_packet_size: Bounds<f64>,
    pub only_ipv6: bool,
    pub only_ethernet: bool,
}

impl FilterRules {
    /// Compile the criteria of `spec`, whose patterns are relative to `root`
    pub fn from_spec(spec: &FinderSpec, root: &Path) -> AppResult<Self> {
        let prefixed = |e: AppError| match e {
            AppError::ConfigError(msg) => {
                AppError::ConfigError(format!("[Finder {}] {}", spec.id, msg))
            }
            other => other,
        };

        let mut patterns = Vec::new();
        for pattern in &spec.patterns {
            if let Some(regex) = compile_pattern(pattern, root).map_err(prefixed)? {
                patterns.push(regex);
            }
        }

        let tag_combos = expand_tag_expressions(&spec.tags);
        if !spec.tags.is_empty() && tag_combos.is_empty() {
            return Err(prefixed(AppError::ConfigError(
                "tags are set but contain no tag".to_string(),
            )));
        }

        Ok(Self {
            patterns,
            tag_combos,
            pps: Bounds::new("pps", spec.pps_le, spec.pps_ge).map_err(prefixed)?,
            packet_count: Bounds::new("packet_count", spec.packet_count_le, spec.packet_count_ge)
                .map_err(prefixed)?,
            avg_packet_size: Bounds::new(
                "avg_packet_size",
                spec.avg_packet_size_le,
                spec.avg_packet_size_ge,
            )
            .map_err(prefixed)?,
            only_ipv6: spec.only_ipv6,
            only_ethernet: spec.only_ethernet,
        })
    }

    /// Whether `target` passes the name patterns (no patterns pass everything)
    pub fn name_matches(&self, target: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.is_match(target))
    }

    pub fn uses_tags(&self) -> bool {
        !self.tag_combos.is_empty()
    }

    /// First metric-based reason to reject a capture, checked as
    /// encapsulation, rate, packet count, then average size.
    pub fn metrics_violation(&self, info: &CaptureInfo) -> Option<String> {
        if self.only_ethernet && !info.is_ethernet() {
            return Some(format!(
                "encapsulation {} is not Ethernet",
                info.encapsulation.as_deref().unwrap_or("unknown")
            ));
        }

        if let Some(reason) =
            float_violation(&self.pps, info, InfoErrors::AVG_PACKET_RATE, "pps", info.avg_packet_rate)
        {
            return Some(reason);
        }
        if self.packet_count.is_set() {
            if info.errors.contains(InfoErrors::PACKET_COUNT) {
                return Some("packet count unavailable".to_string());
            }
            if let Some(reason) = self
                .packet_count
                .violation("packet count value", info.packet_count)
            {
                return Some(reason);
            }
        }
        float_violation(
            &self.avg_packet_size,
            info,
            InfoErrors::AVG_PACKET_SIZE,
            "avg packet size",
            info.avg_packet_size,
        )
    }
}

fn float_violation(
    bounds: &Bounds<f64>,
    info: &CaptureInfo,
    flag: InfoErrors,
    label: &str,
    value: f64,
) -> Option<String> {
    if !bounds.is_set() {
        return None;
    }
    if info.errors.contains(flag) {
        return Some(format!("{} unavailable", label));
    }
    bounds.violation(&format!("{} value", label), value)
}

/// Compile one glob pattern into an anchored, case-insensitive regex.
///
/// Absolute patterns are rebased onto `root`; a pattern naming the root
/// itself is ignored, one outside of it is an error. A trailing `*` is
/// implied.
pub fn compile_pattern(pattern: &str, root: &Path) -> AppResult<Option<Regex>> {
    let mut glob = pattern.trim().to_string();
    if glob.is_empty() {
        return Ok(None);
    }

    let as_path = Path::new(&glob);
    if as_path.is_absolute() {
        if as_path == root {
            warn!("pattern {} equals the search directory, ignored", pattern);
            return Ok(None);
        }
        match as_path.strip_prefix(root) {
            Ok(rest) => glob = rest.to_string_lossy().into_owned(),
            Err(_) => {
                return Err(AppError::ConfigError(format!(
                    "pattern {} is outside of {}",
                    pattern,
                    root.display()
                )))
            }
        }
    }
    if !glob.ends_with('*') {
        glob.push('*');
    }

    let mut source = String::with_capacity(glob.len() + 8);
    source.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');

    RegexBuilder::new(&source)
        .case_insensitive(true)
        .build()
        .map(Some)
        .map_err(|e| AppError::ConfigError(format!("pattern {}: {}", pattern, e)))
}
