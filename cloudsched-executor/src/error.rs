//! Error types for the executor

use thiserror::Error;

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Errors raised by the executor's collaborators
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cloud CLI invocation failed
    #[error("cloud CLI error: {0}")]
    CloudCli(String),

    /// Cloud CLI produced unparseable output
    #[error("invalid cloud CLI response: {0}")]
    CliResponse(#[from] serde_json::Error),

    /// Container image rejected by the runtime
    #[error("container image \"{0}\" is invalid")]
    InvalidImage(String),

    /// Container runtime invocation failed
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// Flavor distribution file could not be generated
    #[error("failed to generate flavor distribution: {0}")]
    Distribution(String),

    /// Flavor missing from the instance type listing
    #[error("unable to query spec for flavor \"{0}\"")]
    UnknownFlavor(String),

    /// Provisioning helper failed
    #[error("provision error: {0}")]
    Provision(String),

    /// Configuration rejected at startup
    #[error("configuration error: {0}")]
    Config(#[from] cloudsched_config::ConfigError),
}
