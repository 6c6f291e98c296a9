use super::queue::{Released, Removal, TaskQueue};
use super::registry::SharedMutexRegistry;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::handle::{CurrentTask, ExecEnv};
use crate::executor::worker::Reservation;
use crate::executor::{PanicHandler, TaskHandle, TaskId};
use crate::telemetry::{Metrics, MetricsSnapshot};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Whether the pool takes new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Accepting,
    /// `stop_when_done` was called; the pool stops once it owns no task.
    Draining,
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Accepting => "accepting",
            Lifecycle::Draining => "draining",
            Lifecycle::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

pub(crate) struct PoolState {
    pub(crate) queue: TaskQueue,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) target_workers: usize,
    pub(crate) live_workers: usize,
}

/// State shared by the scheduler handle, its workers and the tasks it owns
/// (through their weak back-references).
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) registry: Arc<SharedMutexRegistry>,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) work_available: Condvar,
    pub(crate) task_released: Condvar,
    pub(crate) workers: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) next_worker_id: AtomicUsize,
    pub(crate) panic: PanicHandler,
    pub(crate) metrics: Metrics,
}

impl Shared {
    fn new(config: Config) -> Self {
        let registry = Arc::new(SharedMutexRegistry::new(
            config.registry_cleanup_threshold,
            config.registry_scan_budget,
        ));
        let panic = PanicHandler::new(config.panic_strategy);

        Self {
            config,
            registry,
            state: Mutex::new(PoolState {
                queue: TaskQueue::new(),
                lifecycle: Lifecycle::Accepting,
                target_workers: 0,
                live_workers: 0,
            }),
            work_available: Condvar::new(),
            task_released: Condvar::new(),
            workers: Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(0),
            panic,
            metrics: Metrics::new(),
        }
    }

    pub(crate) fn exec_env(&self) -> ExecEnv<'_> {
        ExecEnv {
            panic: &self.panic,
            metrics: Some(&self.metrics),
            slow_threshold: self.config.slow_task_threshold,
        }
    }

    pub(crate) fn add(self: &Arc<Self>, handle: &TaskHandle) -> Result<()> {
        if handle.is_done() {
            return Ok(());
        }

        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Stopped {
            drop(state);
            tracing::debug!(task = handle.name(), id = %handle.id(), "add after shutdown, canceling");
            handle.set_canceled();
            self.finalize_detached(handle);
            return Ok(());
        }

        if !handle.claim_owner(Arc::downgrade(self)) {
            debug_assert!(false, "task {} added while already owned", handle.id());
            return Err(Error::AlreadyOwned(handle.id().as_u64()));
        }
        handle.bind_registry(&self.registry);
        state.queue.insert(handle.clone(), Instant::now());
        drop(state);

        self.work_available.notify_one();
        Ok(())
    }

    pub(crate) fn remove(&self, handle: &TaskHandle, cancel: bool, wait: bool) -> bool {
        if cancel {
            handle.set_canceled();
        }

        let mut state = self.state.lock();
        match state.queue.mark_for_removal(handle.id()) {
            Removal::NotFound => false,
            Removal::Removed(removed) => {
                removed.clear_owner();
                drop(state);
                self.task_released.notify_all();
                if cancel {
                    self.finalize_detached(&removed);
                }
                true
            }
            Removal::Deferred => {
                // a task removing itself cannot wait for its own exit
                if wait && !CurrentTask::is(handle.id()) {
                    while state.queue.contains(handle.id()) {
                        self.task_released.wait(&mut state);
                    }
                }
                true
            }
        }
    }

    pub(crate) fn reschedule(&self, handle: &TaskHandle, priority: Option<f64>) -> bool {
        if let Some(priority) = priority {
            handle.set_priority(priority);
        }

        let rescheduled = {
            let mut state = self.state.lock();
            state.queue.reschedule(handle.id(), Instant::now())
        };
        if rescheduled {
            self.work_available.notify_one();
        }
        rescheduled
    }

    pub(crate) fn mark_running(&self, id: TaskId) {
        self.state.lock().queue.mark_running(id);
    }

    /// A worker hands back a task after running one unit of it, or without
    /// running it because a forced execution holds its mutex. Returns the task
    /// if the scheduler let go of it.
    pub(crate) fn hand_back(&self, handle: TaskHandle) -> Option<TaskHandle> {
        let mut state = self.state.lock();
        let stopping = state.lifecycle == Lifecycle::Stopped;
        if stopping {
            handle.set_canceled();
        }

        let keep = !handle.is_done() && !handle.is_canceled() && !stopping;
        let released = state.queue.release(handle.id(), keep, Instant::now());
        let dropped = match released {
            Released::Requeued => None,
            Released::Dropped(dropped) => {
                dropped.clear_owner();
                Some(dropped)
            }
            Released::NotFound => None,
        };
        drop(state);

        self.task_released.notify_all();
        if dropped.is_none() {
            self.work_available.notify_one();
        }
        dropped
    }

    /// Lets go of a reserved task whose execution mutex is held elsewhere.
    ///
    /// The holder is either a forced execution, which takes the task out of
    /// the pool anyway, or a finalizer of a task that is already ending.
    /// Re-queueing it would have the workers pick it again at once.
    pub(crate) fn release_contended(&self, handle: TaskHandle) {
        let mut state = self.state.lock();
        let released = state.queue.release(handle.id(), false, Instant::now());
        if let Released::Dropped(dropped) = released {
            dropped.clear_owner();
        }
        drop(state);
        self.task_released.notify_all();
    }

    /// Fires the completion hook of a task the scheduler no longer owns,
    /// serialized against any forced execution of it.
    pub(crate) fn finalize_detached(&self, handle: &TaskHandle) {
        let mutex = handle.registry().get_or_create(handle.id());
        let _guard = mutex.lock();
        handle.finalize(&self.exec_env());
    }

    pub(crate) fn info(&self) -> SchedulerInfo {
        let state = self.state.lock();
        SchedulerInfo {
            queued: state.queue.queued(),
            running: state.queue.in_flight(),
            overdue: state.queue.overdue(Instant::now(), self.config.overdue_grace),
            workers: state.live_workers,
            lifecycle: state.lifecycle,
        }
    }
}

/// Point-in-time view of the pool for operational debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerInfo {
    pub queued: usize,
    pub running: usize,
    pub overdue: usize,
    pub workers: usize,
    pub lifecycle: Lifecycle,
}

impl fmt::Display for SchedulerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queued={} running={} overdue={} workers={} lifecycle={}",
            self.queued, self.running, self.overdue, self.workers, self.lifecycle
        )
    }
}

/// Priority task pool.
///
/// Owns the pending and running tasks and a set of worker threads started
/// with [`run`](Scheduler::run). Every operation is safe to call from any
/// thread, including from inside a task's own `body`. Dropping the scheduler
/// shuts it down.
pub struct Scheduler {
    pub(crate) shared: Arc<Shared>,
}

impl Scheduler {
    /// Creates an idle scheduler. Tasks can be added right away; nothing runs
    /// until [`run`](Scheduler::run) starts workers.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared::new(config)),
        })
    }

    /// Creates a scheduler and starts `config.worker_threads()` workers.
    pub fn start(config: Config) -> Result<Self> {
        let workers = config.worker_threads();
        let scheduler = Self::new(config)?;
        scheduler.run(workers)?;
        Ok(scheduler)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Queues a task and wakes one idle worker.
    ///
    /// After [`shutdown`](Scheduler::shutdown) the task is canceled instead,
    /// without its body ever running. Adding a task another scheduler (or this
    /// one) already owns is a programmer error.
    pub fn add(&self, task: &TaskHandle) -> Result<()> {
        self.shared.add(task)
    }

    /// Takes a task away from the pool.
    ///
    /// A queued task is removed at once. A reserved or running one is dropped
    /// by its worker when the current unit ends; with `wait` set, this call
    /// blocks until then, so the pool never runs the task again once it
    /// returns. Returns `false` if this scheduler does not own the task.
    pub fn remove(&self, task: &TaskHandle, cancel: bool, wait: bool) -> bool {
        self.shared.remove(task, cancel, wait)
    }

    /// Re-derives a task's queue position from its current priority and
    /// eligibility time, optionally setting a new priority first.
    pub fn reschedule(&self, task: &TaskHandle, priority: Option<f64>) -> bool {
        self.shared.reschedule(task, priority)
    }

    pub fn set_priority(&self, task: &TaskHandle, priority: f64) -> bool {
        self.shared.reschedule(task, Some(priority))
    }

    /// Reserves the highest-priority eligible task, as a worker would.
    ///
    /// The reservation keeps other workers off the task until it is run with
    /// [`Reservation::run`] or dropped, which hands the task back untouched.
    pub fn pick_next(&self) -> Option<Reservation<'_>> {
        let handle = self.shared.state.lock().queue.pick(Instant::now())?;
        Some(Reservation::new(&self.shared, handle))
    }

    /// Tasks owned by the pool: queued, reserved and running. O(1).
    pub fn task_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Reserved plus running tasks. O(1).
    pub fn running_tasks(&self) -> usize {
        self.shared.state.lock().queue.in_flight()
    }

    /// Queued tasks eligible for at least `Config::overdue_grace` without a
    /// worker picking them up. O(n) scan, for diagnostics only.
    pub fn overdue_tasks(&self) -> usize {
        let state = self.shared.state.lock();
        state
            .queue
            .overdue(Instant::now(), self.shared.config.overdue_grace)
    }

    /// Queue, running and overdue counts. Also logged at debug level.
    /// Includes the O(n) overdue scan.
    pub fn dump_info(&self) -> SchedulerInfo {
        let info = self.shared.info();
        tracing::debug!(%info, "scheduler state");
        info
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Zeroes the counters and the body-latency histogram. Uptime keeps
    /// counting from the scheduler's creation.
    pub fn reset_metrics(&self) {
        self.shared.metrics.reset();
        tracing::debug!("metrics reset");
    }

    pub fn registry(&self) -> &Arc<SharedMutexRegistry> {
        &self.shared.registry
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("info", &self.shared.info())
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
