//! Configuration management for the cloudsched test scheduler
//!
//! TOML-based configuration with startup validation. The scheduler and
//! the executor share one config file; each binary validates the
//! sections it consumes and aborts on the first problem.

mod config;
mod error;

pub use config::load_config;
pub use config::{Config, ExecutorConfig, SchedulerConfig, TestConfig};
pub use error::{ConfigError, ConfigResult};
