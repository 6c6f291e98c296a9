//! Priority task pool.
//!
//! [`Scheduler`] keeps every task it owns in one of four places: the ready
//! queue (eligible now, ordered by priority), the delayed queue (ordered by
//! eligibility time), reserved by a worker, or running. A single state mutex
//! guards all of it; each task additionally has an execution mutex from the
//! [`SharedMutexRegistry`] that serializes pooled and forced execution.
//!
//! Lock order is always execution mutex, then state mutex.

pub(crate) mod core;
mod lifecycle;
pub(crate) mod queue;
pub mod registry;

pub use self::core::{Lifecycle, Scheduler, SchedulerInfo};
pub use registry::{ExecMutex, SharedMutexRegistry};
