//! KRIYA - cooperative priority task pool
//!
//! Long-lived, resumable tasks run in short units on a fixed set of worker
//! threads, highest priority first. Any task can also be forced to run right
//! now on the calling thread, with the guarantee that no task is ever executed
//! by two threads at once.
//!
//! # Quick Start
//!
//! ```no_run
//! use kriya_rs::prelude::*;
//!
//! let scheduler = Scheduler::start(Config::default()).unwrap();
//!
//! let (task, answer) = once("answer", |_| 6 * 7);
//! scheduler.add(&task).unwrap();
//! assert_eq!(answer.wait().unwrap(), 42);
//!
//! scheduler.shutdown();
//! ```
//!
//! # Features
//!
//! - **Priority Scheduling**: Eligible tasks run by priority, then by age
//! - **Delayed Tasks**: Tasks can push their next run into the future
//! - **Forced Execution**: `run_now` steals a task from the pool and runs it inline
//! - **Cancellation**: One-way flag observed between units, with exactly one
//!   completion hook per task
//! - **Telemetry**: Counters and body latency histogram (optional)

// Lint configuration
#![warn(missing_debug_implementations)]

// Core modules - always available
pub mod config;
pub mod error;
pub mod executor;
pub mod prelude;
pub mod scheduler;
pub mod telemetry;
pub mod util;

// Re-export key types at crate root
pub use config::{Config, ConfigBuilder};
pub use error::{Error, Result};
pub use executor::{CancelToken, Task, TaskContext, TaskHandle, TaskId, TaskState};
pub use scheduler::{Scheduler, SchedulerInfo, SharedMutexRegistry};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::once;

    #[test]
    fn test_basic_one_shot() {
        let scheduler = Scheduler::start(Config::builder().num_threads(2).build().unwrap()).unwrap();

        let (task, result) = once("sum", |_| (0..100).sum::<i32>());
        scheduler.add(&task).unwrap();

        assert_eq!(result.wait().unwrap(), 4950);
        scheduler.shutdown();
    }

    #[test]
    fn test_run_now_without_pool() {
        let (task, result) = once("inline", |_| "done");

        assert!(task.run_now(true));
        assert_eq!(result.wait().unwrap(), "done");
    }
}
