//! Per-flavor test executor for cloudsched
//!
//! One attempt of one flavor: resolve an availability zone, lock a
//! container from the pool, provision the test input, run the
//! containerized test and classify the result into a single integer
//! status code. The binary's process exit code is that status code;
//! the scheduler reads it back from the subprocess wait.

pub mod cloud;
pub mod codes;
pub mod container;
mod error;
pub mod executor;
pub mod flavor;
pub mod provision;

pub use error::{ExecutorError, ExecutorResult};
pub use executor::TestExecutor;
