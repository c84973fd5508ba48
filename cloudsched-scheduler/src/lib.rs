//! Task scheduling for containerized cloud compatibility tests
//!
//! One process owns a TOML task list. A producer thread audits the
//! list and feeds a FIFO queue, honoring one-shot patch files dropped
//! beside the list; a consumer thread drains the queue through a
//! bounded pool of worker threads, each running the per-flavor
//! executor and classifying its exit code into a retry class.

mod error;
pub mod patch;
pub mod scheduler;
pub mod store;
pub mod task;

pub use error::{SchedulerError, SchedulerResult};
pub use patch::{PatchAction, PatchRecord, PatchSet};
pub use scheduler::{retry_counter_for, TestScheduler};
pub use store::{RetryDefaults, TaskStore};
pub use task::{RetryCounter, TaskRecord, TaskStatus, TaskUpdate};
