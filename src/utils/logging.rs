use env_logger::{Builder, Target};
use log::LevelFilter;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::utils::error::{AppError, AppResult};

fn builder(level: LevelFilter) -> Builder {
    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level);
    builder
}

/// Initialize the logger with custom formatting
pub fn init_logger(level: LevelFilter) {
    builder(level).init();
}

/// Initialize the logger so that every record is appended to `path`.
///
/// Used by the background child, which has no terminal attached.
pub fn init_file_logger(level: LevelFilter, path: &Path) -> AppResult<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    builder(level)
        .target(Target::Pipe(Box::new(file)))
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("logger already initialized: {}", e)))
}

/// Get log level from string
pub fn get_log_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// Pick the effective level from the verbosity switches.
///
/// `--debug` wins over `--quiet`, and both win over an explicit level string.
pub fn resolve_level(debug: bool, quiet: bool, level: Option<&str>) -> LevelFilter {
    if debug {
        LevelFilter::Debug
    } else if quiet {
        LevelFilter::Warn
    } else {
        level.map(get_log_level).unwrap_or(LevelFilter::Info)
    }
}
