//! Human readable durations such as `30s`, `1h3m5s` or `500ms`.

use std::time::Duration;

/// Parse a duration expression.
///
/// A bare integer is a number of seconds. Otherwise the text is a sequence of
/// `<number><unit>` groups with units `h`, `m`, `s`, `ms`, `us` or `ns`.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration `{}`", text))?;
        if digits == 0 {
            return Err(format!("invalid duration `{}`", text));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid number in duration `{}`", text))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            other => return Err(format!("unknown unit `{}` in duration `{}`", other, text)),
        };
        rest = &rest[unit_len..];
        let part = Duration::try_from_secs_f64(value * scale)
            .map_err(|_| format!("duration `{}` is out of range", text))?;
        total = total
            .checked_add(part)
            .ok_or_else(|| format!("duration `{}` is out of range", text))?;
    }
    Ok(total)
}

/// Render a duration in the same syntax `parse_duration` accepts.
pub fn format_duration(duration: Duration) -> String {
    let mut secs = duration.as_secs();
    let millis = duration.subsec_millis();
    if secs == 0 && millis == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    secs %= 60;
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if secs > 0 {
        out.push_str(&format!("{}s", secs));
    }
    if millis > 0 {
        out.push_str(&format!("{}ms", millis));
    }
    out
}

/// `#[serde(with = "...")]` adapter accepting either a string expression or
/// an integer number of seconds.
pub mod serde_duration {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(de::Error::custom),
        }
    }
}
