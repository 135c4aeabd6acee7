use std::time::Duration;
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Error from I/O operations
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Error from JSON serialization/deserialization
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Error from the TOML configuration file
    #[error("config file error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Invalid configuration, detected before any work starts
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// A used finder failed to initialize or matched nothing
    #[error("discovery failed: {0}")]
    DiscoveryError(String),

    /// One-time staging of a finder or capture failed
    #[error("staging failed: {0}")]
    StagingError(String),

    /// A per-run generation step failed
    #[error("transform failed: {0}")]
    TransformError(String),

    /// Capture container or packet could not be decoded
    #[error("packet parsing error: {0}")]
    PacketParsingError(String),

    /// A command exited unsuccessfully
    #[error("`{command}` failed, output is:\n{output}")]
    ExecutionError { command: String, output: String },

    /// A command ran past its timeout and was killed
    #[error("`{command}` timed out after {timeout:?}, output is:\n{output}")]
    TimeoutError {
        command: String,
        timeout: Duration,
        output: String,
    },

    /// A command template could not be rendered
    #[error("template error: {0}")]
    TemplateError(String),

    /// Background start-up handshake failed
    #[error("daemon error: {0}")]
    DaemonError(String),

    /// An external tool could not be resolved
    #[error("tool error: {0}")]
    ToolError(String),
}

impl AppError {
    /// Output captured from the failing process, if any
    pub fn output(&self) -> Option<&str> {
        match self {
            AppError::ExecutionError { output, .. } | AppError::TimeoutError { output, .. } => {
                Some(output.as_str())
            }
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AppError::TimeoutError { .. })
    }
}

/// Result type for application
pub type AppResult<T> = Result<T, AppError>;
