//! Task execution infrastructure.
//!
//! Tasks, their shared handles, the single-unit execution step shared by pool
//! workers and `run_now`, panic isolation, and closure-based adapters.

pub mod adapters;
pub(crate) mod handle;
pub mod panic_handler;
pub mod task;
pub(crate) mod worker;

pub use adapters::{once, once_after, repeating, Completion, OneShotTask, Repeat, RepeatingTask};
pub use handle::TaskHandle;
pub use panic_handler::{PanicHandler, PanicInfo, PanicStrategy};
pub use task::{CancelToken, Task, TaskContext, TaskId, TaskState};
pub use worker::Reservation;
