//! Task contract and per-call execution context.

use super::handle::TaskHandle;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global task ID counter
static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a task. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        TaskId(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a task. Transitions are monotonic: `Waiting -> Running -> Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TaskState {
    Waiting = 0,
    Running = 1,
    Done = 2,
}

impl TaskState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Waiting,
            1 => TaskState::Running,
            _ => TaskState::Done,
        }
    }
}

/// One-way cancellation flag shared between a task handle and its body.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// A schedulable, cancellable, resumable unit of work.
///
/// `body` is called repeatedly by whichever executor currently owns the task,
/// a pool worker or a `run_now` caller, until the task calls
/// [`TaskContext::set_finished`] or cancellation is observed. A single call is
/// expected to be short: long operations should do a chunk of work, then
/// reschedule themselves through the context.
///
/// Only one executor calls into a given task at a time, so implementations
/// need interior mutability for their own state but never have to guard
/// against concurrent `body` calls.
///
/// Failures are the task's own business. Report them through whatever
/// completion channel the task exposes before calling `set_finished`.
pub trait Task: Send + Sync + 'static {
    /// Called with the cancellation token of the task. Long bodies should poll
    /// it; the executor never interrupts a call in flight.
    fn body(&self, cx: &TaskContext<'_>, cancel: &CancelToken);

    /// Runs once, right before the first `body` call.
    fn initialize(&self, _cx: &TaskContext<'_>) {}

    /// Runs once when the task ends without having finished itself.
    fn canceled(&self) {}

    /// Runs once after the task called `set_finished`.
    fn finished(&self) {}

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// The view of its own handle a task gets while executing.
#[derive(Debug)]
pub struct TaskContext<'a> {
    handle: &'a TaskHandle,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(handle: &'a TaskHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &TaskHandle {
        self.handle
    }

    pub fn is_canceled(&self) -> bool {
        self.handle.is_canceled()
    }

    pub fn set_finished(&self) {
        self.handle.set_finished();
    }

    pub fn priority(&self) -> f64 {
        self.handle.priority()
    }

    pub fn set_priority(&self, priority: f64) {
        self.handle.set_priority(priority);
    }

    pub fn schedule_from_now_secs(&self, secs: f64) {
        self.handle.schedule_from_now_secs(secs);
    }

    pub fn schedule_after(&self, delay: Duration) {
        self.handle.schedule_after(delay);
    }

    pub fn scheduled_at(&self) -> Instant {
        self.handle.scheduled_at()
    }

    /// Tells the owning scheduler to re-derive this task's queue position.
    /// Returns `false` when the task is not owned by a scheduler.
    pub fn reschedule(&self) -> bool {
        match self.handle.owner() {
            Some(owner) => owner.reschedule(self.handle, None),
            None => false,
        }
    }
}
