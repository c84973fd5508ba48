//! Error types for the scheduler

use thiserror::Error;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors raised by the scheduler and the task store
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Task list is not valid TOML
    #[error("failed to parse task list: {0}")]
    Parse(#[from] toml::de::Error),

    /// Task list could not be serialized
    #[error("failed to serialize task list: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Store mutex was held past the acquisition bound
    #[error("timed out acquiring the task store lock")]
    LockTimeout,

    /// Consumer thread died; the task list reflects the last save
    #[error("the consumer thread panicked")]
    ConsumerPanicked,

    /// Configuration rejected at startup
    #[error("configuration error: {0}")]
    Config(#[from] cloudsched_config::ConfigError),
}
