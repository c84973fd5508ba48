//! Error types for configuration handling

use thiserror::Error;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("I/O error: {0}")]
    Io(String),

    /// Configuration file is not valid TOML
    #[error("parse error: {0}")]
    Parse(String),

    /// Configuration content failed validation
    #[error("validation error: {0}")]
    Validation(String),
}
