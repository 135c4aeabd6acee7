pub mod capture_info;
pub mod config;
pub mod filter;
pub mod job;
pub mod modifier;
pub mod packet;
pub mod record;
pub mod stats;
pub mod tags;

use lazy_static::lazy_static;
use regex::Regex;

use crate::utils::error::{AppError, AppResult};

lazy_static! {
    static ref ID_PATTERN: Regex = Regex::new(r"(?i)^[a-z][a-z0-9_-]*$").expect("id regex");
}

/// Validate a finder, modifier or job identifier.
///
/// Identifiers start with a letter followed by letters, digits, `_` or `-`.
/// `all` is reserved for job selection.
pub fn check_id(id: &str) -> AppResult<()> {
    if id.is_empty() {
        return Err(AppError::ConfigError("id is empty".to_string()));
    }
    if id.eq_ignore_ascii_case("all") {
        return Err(AppError::ConfigError("id `all` is reserved".to_string()));
    }
    if !ID_PATTERN.is_match(id) {
        return Err(AppError::ConfigError(format!(
            "id `{}` must start with a letter and contain only letters, digits, `_` or `-`",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::check_id;

    #[test]
    fn valid_identifiers() {
        for id in ["a", "zeek", "Old-Suricata", "job_2", "x-1_y"] {
            assert!(check_id(id).is_ok(), "{}", id);
        }
    }

    #[test]
    fn invalid_identifiers() {
        for id in ["", "all", "ALL", "1job", "-x", "_x", "has space", "dot.ted", "ü"] {
            assert!(check_id(id).is_err(), "{}", id);
        }
    }
}
