// worker thread stuff
use super::handle::TaskHandle;
use super::task::TaskId;
use crate::scheduler::core::Shared;
use std::cell::Cell;
use std::sync::Arc;

pub type WorkerId = usize;

thread_local! {
    // reserved task this thread is executing, until it is handed back
    static HELD: Cell<Option<TaskId>> = const { Cell::new(None) };
}

/// The reserved task the calling thread is executing, if any. Cleared before
/// the task is handed back to its pool.
pub(crate) fn held_task() -> Option<TaskId> {
    HELD.with(|held| held.get())
}

struct Held {
    previous: Option<TaskId>,
}

impl Held {
    fn enter(id: TaskId) -> Self {
        let previous = HELD.with(|held| held.replace(Some(id)));
        Self { previous }
    }
}

impl Drop for Held {
    fn drop(&mut self) {
        HELD.with(|held| held.set(self.previous));
    }
}

pub(crate) struct Worker {
    pub id: WorkerId,
    shared: Arc<Shared>,
}

impl Worker {
    pub fn new(id: WorkerId, shared: Arc<Shared>) -> Self {
        Self { id, shared }
    }

    // main loop, exits when the pool retires this worker
    pub fn run(&self) {
        tracing::debug!(worker = self.id, "worker started");

        let mut units = 0u64;
        while let Some(task) = self.shared.wait_for_task() {
            execute_reserved(&self.shared, task);
            units += 1;
        }

        tracing::debug!(worker = self.id, units, "worker exited");
    }
}

/// Runs one unit of a task the pool reserved for the calling thread, then
/// hands it back. Returns whether the unit actually ran.
///
/// The worker only `try_lock`s the execution mutex. If it is held, a forced
/// execution or a finalizer owns the task, so the pool lets go of it unrun
/// instead of blocking a pool thread or spinning on it.
pub(crate) fn execute_reserved(shared: &Shared, task: TaskHandle) -> bool {
    let mutex = task.registry().get_or_create(task.id());
    let Some(guard) = mutex.try_lock() else {
        tracing::debug!(task = task.name(), id = %task.id(), "task is being forced elsewhere, releasing it");
        shared.release_contended(task);
        return false;
    };

    let held = Held::enter(task.id());
    shared.mark_running(task.id());
    task.run_unit(&shared.exec_env());
    drop(held);

    if let Some(dropped) = shared.hand_back(task) {
        // canceled after the body returned, or by a shutdown
        if dropped.is_canceled() {
            dropped.finalize(&shared.exec_env());
        }
    }
    drop(guard);
    true
}

/// A task reserved through [`Scheduler::pick_next`].
///
/// No worker touches the task while the reservation lives. [`run`] executes
/// one unit of it on the calling thread; dropping the reservation instead
/// hands the task back as it was.
///
/// [`Scheduler::pick_next`]: crate::scheduler::Scheduler::pick_next
/// [`run`]: Reservation::run
pub struct Reservation<'a> {
    shared: &'a Shared,
    task: Option<TaskHandle>,
}

impl<'a> Reservation<'a> {
    pub(crate) fn new(shared: &'a Shared, task: TaskHandle) -> Self {
        Self {
            shared,
            task: Some(task),
        }
    }

    pub fn task(&self) -> Option<&TaskHandle> {
        self.task.as_ref()
    }

    /// Runs one unit of the task, exactly as a worker would. Returns `false`
    /// if a forced execution held the task, in which case nothing ran.
    pub fn run(mut self) -> bool {
        match self.task.take() {
            Some(task) => execute_reserved(self.shared, task),
            None => false,
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if let Some(dropped) = self.shared.hand_back(task) {
            if dropped.is_canceled() {
                self.shared.finalize_detached(&dropped);
            }
        }
    }
}

impl std::fmt::Debug for Reservation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation").field("task", &self.task).finish()
    }
}
