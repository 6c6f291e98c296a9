//! Shared task handle and the single-unit execution step used by both the
//! pool workers and forced (`run_now`) execution.

use super::panic_handler::PanicHandler;
use super::task::{CancelToken, Task, TaskContext, TaskId, TaskState};
use crate::scheduler::core::Shared;
use crate::scheduler::registry::SharedMutexRegistry;
use crate::telemetry::Metrics;
use crate::util::AtomicF64;
use parking_lot::Mutex;
use std::cell::Cell;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

thread_local! {
    static CURRENT_TASK: Cell<Option<TaskId>> = const { Cell::new(None) };
}

/// Marks the calling thread as executing a task until dropped.
pub(crate) struct CurrentTask {
    previous: Option<TaskId>,
}

impl CurrentTask {
    fn enter(id: TaskId) -> Self {
        let previous = CURRENT_TASK.with(|current| current.replace(Some(id)));
        Self { previous }
    }

    pub(crate) fn get() -> Option<TaskId> {
        CURRENT_TASK.with(|current| current.get())
    }

    pub(crate) fn is(id: TaskId) -> bool {
        Self::get() == Some(id)
    }
}

impl Drop for CurrentTask {
    fn drop(&mut self) {
        CURRENT_TASK.with(|current| current.set(self.previous));
    }
}

/// What an executor needs besides the task itself.
pub(crate) struct ExecEnv<'a> {
    pub(crate) panic: &'a PanicHandler,
    pub(crate) metrics: Option<&'a Metrics>,
    pub(crate) slow_threshold: Option<Duration>,
}

impl<'a> ExecEnv<'a> {
    fn detached(panic: &'a PanicHandler) -> Self {
        Self {
            panic,
            metrics: None,
            slow_threshold: None,
        }
    }

    fn observe_body(&self, handle: &TaskHandle, elapsed: Duration) {
        if let Some(metrics) = self.metrics {
            metrics.record_body(elapsed.as_nanos() as u64);
        }

        if let Some(threshold) = self.slow_threshold {
            if elapsed > threshold {
                if let Some(metrics) = self.metrics {
                    metrics.record_slow_body();
                }
                tracing::warn!(
                    task = handle.name(),
                    id = %handle.id(),
                    origin = %handle.origin(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    age_ms = handle.created_at().elapsed().as_millis() as u64,
                    "slow task body"
                );
            }
        }
    }
}

struct TaskCell {
    id: TaskId,
    state: AtomicU8,
    finalized: AtomicBool,
    priority: AtomicF64,
    scheduled_at: Mutex<Instant>,
    cancel: CancelToken,
    owner: Mutex<Weak<Shared>>,
    registry: OnceLock<Arc<SharedMutexRegistry>>,
    created_at: Instant,
    origin: &'static Location<'static>,
    task: Box<dyn Task>,
}

/// Reference-counted handle to a task.
///
/// Producers and the owning scheduler each hold clones; the task is destroyed
/// when the last clone goes away. Cloning is cheap.
#[derive(Clone)]
pub struct TaskHandle {
    cell: Arc<TaskCell>,
}

impl TaskHandle {
    /// Wraps a task. It starts `Waiting`, priority 0, eligible immediately.
    #[track_caller]
    pub fn new<T: Task>(task: T) -> Self {
        let now = Instant::now();
        Self {
            cell: Arc::new(TaskCell {
                id: TaskId::next(),
                state: AtomicU8::new(TaskState::Waiting as u8),
                finalized: AtomicBool::new(false),
                priority: AtomicF64::new(0.0),
                scheduled_at: Mutex::new(now),
                cancel: CancelToken::new(),
                owner: Mutex::new(Weak::new()),
                registry: OnceLock::new(),
                created_at: now,
                origin: Location::caller(),
                task: Box::new(task),
            }),
        }
    }

    /// Builder-style priority, for handles not yet handed to a scheduler.
    pub fn with_priority(self, priority: f64) -> Self {
        self.set_priority(priority);
        self
    }

    pub fn id(&self) -> TaskId {
        self.cell.id
    }

    pub fn name(&self) -> &str {
        self.cell.task.name()
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.cell.state.load(Ordering::Acquire))
    }

    pub fn is_done(&self) -> bool {
        self.state() == TaskState::Done
    }

    pub fn priority(&self) -> f64 {
        self.cell.priority.load(Ordering::Acquire)
    }

    /// Data-only: the queue position changes on the next reschedule.
    pub fn set_priority(&self, priority: f64) {
        let priority = if priority.is_nan() { 0.0 } else { priority };
        self.cell.priority.store(priority, Ordering::Release);
    }

    pub fn scheduled_at(&self) -> Instant {
        *self.cell.scheduled_at.lock()
    }

    pub fn is_eligible(&self, now: Instant) -> bool {
        self.scheduled_at() <= now
    }

    /// Sets the eligibility time to `now + secs`. Zero, negative or NaN
    /// values mean "eligible now". Data-only, like [`set_priority`].
    ///
    /// [`set_priority`]: TaskHandle::set_priority
    pub fn schedule_from_now_secs(&self, secs: f64) {
        let delay = if secs.is_nan() || secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(secs).unwrap_or(FAR_FUTURE)
        };
        self.schedule_after(delay);
    }

    pub fn schedule_after(&self, delay: Duration) {
        let now = Instant::now();
        let mut delay = delay.min(FAR_FUTURE);
        // halve until representable, never collapsing to "eligible now"
        let at = loop {
            match now.checked_add(delay) {
                Some(at) => break at,
                None => delay /= 2,
            }
        };
        self.schedule_at(at);
    }

    pub fn schedule_at(&self, at: Instant) {
        *self.cell.scheduled_at.lock() = at;
    }

    pub fn set_canceled(&self) {
        self.cell.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cell.cancel.is_canceled()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cell.cancel
    }

    pub fn set_finished(&self) {
        self.advance(TaskState::Done);
    }

    pub fn created_at(&self) -> Instant {
        self.cell.created_at
    }

    /// Where this handle was created.
    pub fn origin(&self) -> &'static Location<'static> {
        self.cell.origin
    }

    pub fn is_owned(&self) -> bool {
        self.owner().is_some()
    }

    /// Forces synchronous execution on the calling thread.
    ///
    /// Takes the task's execution mutex, pulls the task out of its scheduler
    /// (waiting for a pooled run in flight to exit), then calls `body` once,
    /// or until the task is done when `finish` is set. Returns whether the
    /// task is done afterwards.
    ///
    /// A no-op for tasks already done or canceled, and for a task calling
    /// `run_now` on itself from inside its own body.
    pub fn run_now(&self, finish: bool) -> bool {
        if self.is_done() || self.is_canceled() {
            return self.is_done();
        }
        if CurrentTask::is(self.id()) {
            tracing::warn!(task = self.name(), id = %self.id(), "run_now called from the task's own body");
            return false;
        }

        let mutex = self.registry().get_or_create(self.id());
        let _guard = mutex.lock();

        let owner = self.owner();
        if let Some(owner) = &owner {
            owner.remove(self, false, true);
        }

        let fallback;
        let env = match &owner {
            Some(owner) => owner.exec_env(),
            None => {
                fallback = PanicHandler::default();
                ExecEnv::detached(&fallback)
            }
        };
        if let Some(metrics) = env.metrics {
            metrics.record_forced_run();
        }

        while !self.run_unit(&env) && finish {}
        self.is_done()
    }

    /// Runs one unit: `initialize` if still waiting, then a single `body` call,
    /// then the completion hook if the task ended. Returns `true` once the task
    /// is done. The caller must hold the task's execution mutex.
    pub(crate) fn run_unit(&self, env: &ExecEnv<'_>) -> bool {
        if self.is_done() || self.is_canceled() {
            self.finalize(env);
            return true;
        }

        let _current = CurrentTask::enter(self.id());
        let cx = TaskContext::new(self);
        let task = &self.cell.task;

        if self.state() == TaskState::Waiting {
            if env.panic.execute(task.name(), || task.initialize(&cx)).is_err() {
                self.fail(env);
                return true;
            }
            self.advance(TaskState::Running);
        }

        if !self.is_done() && !self.is_canceled() {
            let started = Instant::now();
            let outcome = env
                .panic
                .execute(task.name(), || task.body(&cx, &self.cell.cancel));
            env.observe_body(self, started.elapsed());

            if outcome.is_err() {
                self.fail(env);
                return true;
            }
        }

        if self.is_done() || self.is_canceled() {
            self.finalize(env);
            return true;
        }
        false
    }

    /// Moves the task to `Done` and fires exactly one of `finished` or
    /// `canceled`, once per task. The caller must hold the execution mutex.
    pub(crate) fn finalize(&self, env: &ExecEnv<'_>) {
        if self.cell.finalized.swap(true, Ordering::AcqRel) {
            return;
        }

        let finished_by_task = self.is_done();
        self.advance(TaskState::Done);

        let task = &self.cell.task;
        if finished_by_task {
            let _ = env.panic.execute(task.name(), || task.finished());
            if let Some(metrics) = env.metrics {
                metrics.record_completed();
            }
        } else {
            let _ = env.panic.execute(task.name(), || task.canceled());
            if let Some(metrics) = env.metrics {
                metrics.record_canceled();
            }
        }
    }

    fn fail(&self, env: &ExecEnv<'_>) {
        if let Some(metrics) = env.metrics {
            metrics.record_panic();
        }
        self.set_canceled();
        self.finalize(env);
    }

    fn advance(&self, state: TaskState) {
        self.cell.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    pub(crate) fn owner(&self) -> Option<Arc<Shared>> {
        self.cell.owner.lock().upgrade()
    }

    /// Sets the owner unless another live scheduler already holds the task.
    pub(crate) fn claim_owner(&self, owner: Weak<Shared>) -> bool {
        let mut current = self.cell.owner.lock();
        if current.strong_count() > 0 {
            return false;
        }
        *current = owner;
        true
    }

    pub(crate) fn clear_owner(&self) {
        *self.cell.owner.lock() = Weak::new();
    }

    /// Binds the registry that serializes every execution of this task.
    /// The first binding wins and holds for the life of the task.
    pub(crate) fn bind_registry(&self, registry: &Arc<SharedMutexRegistry>) {
        let _ = self.cell.registry.set(Arc::clone(registry));
    }

    pub(crate) fn registry(&self) -> &Arc<SharedMutexRegistry> {
        self.cell
            .registry
            .get_or_init(|| Arc::new(SharedMutexRegistry::default()))
    }

    #[cfg(test)]
    pub(crate) fn ptr_eq(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

/// Upper bound for eligibility delays, roughly a century.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .field("priority", &self.priority())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct Steps {
        remaining: AtomicUsize,
        bodies: Arc<AtomicUsize>,
        initialized: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
        canceled: Arc<AtomicUsize>,
    }

    #[derive(Clone, Default)]
    struct Counters {
        bodies: Arc<AtomicUsize>,
        initialized: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
        canceled: Arc<AtomicUsize>,
    }

    impl Steps {
        fn new(steps: usize, counters: &Counters) -> Self {
            Self {
                remaining: AtomicUsize::new(steps),
                bodies: counters.bodies.clone(),
                initialized: counters.initialized.clone(),
                finished: counters.finished.clone(),
                canceled: counters.canceled.clone(),
            }
        }
    }

    impl Task for Steps {
        fn initialize(&self, _cx: &TaskContext<'_>) {
            self.initialized.fetch_add(1, Ordering::SeqCst);
        }

        fn body(&self, cx: &TaskContext<'_>, _cancel: &CancelToken) {
            self.bodies.fetch_add(1, Ordering::SeqCst);
            if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                cx.set_finished();
            }
        }

        fn canceled(&self) {
            self.canceled.fetch_add(1, Ordering::SeqCst);
        }

        fn finished(&self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_new_handle_defaults() {
        let counters = Counters::default();
        let handle = TaskHandle::new(Steps::new(1, &counters));

        assert_eq!(handle.state(), TaskState::Waiting);
        assert_eq!(handle.priority(), 0.0);
        assert!(!handle.is_canceled());
        assert!(!handle.is_owned());
        assert!(handle.is_eligible(Instant::now()));
        assert!(handle.origin().file().ends_with("handle.rs"));
    }

    #[test]
    fn test_run_now_single_step() {
        let counters = Counters::default();
        let handle = TaskHandle::new(Steps::new(3, &counters));

        assert!(!handle.run_now(false));
        assert_eq!(handle.state(), TaskState::Running);
        assert_eq!(counters.bodies.load(Ordering::SeqCst), 1);
        assert_eq!(counters.initialized.load(Ordering::SeqCst), 1);

        assert!(handle.run_now(true));
        assert_eq!(counters.bodies.load(Ordering::SeqCst), 3);
        assert_eq!(counters.initialized.load(Ordering::SeqCst), 1);
        assert_eq!(counters.finished.load(Ordering::SeqCst), 1);
        assert_eq!(counters.canceled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_run_now_noop_when_done_or_canceled() {
        let counters = Counters::default();
        let done = TaskHandle::new(Steps::new(1, &counters));
        assert!(done.run_now(true));
        assert!(done.run_now(true));
        assert_eq!(counters.bodies.load(Ordering::SeqCst), 1);

        let canceled = TaskHandle::new(Steps::new(1, &counters));
        canceled.set_canceled();
        assert!(!canceled.run_now(true));
        assert_eq!(counters.bodies.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_state_never_goes_backwards() {
        let counters = Counters::default();
        let handle = TaskHandle::new(Steps::new(1, &counters));
        handle.set_finished();
        handle.advance(TaskState::Running);
        assert_eq!(handle.state(), TaskState::Done);
    }

    #[test]
    fn test_schedule_from_now() {
        let counters = Counters::default();
        let handle = TaskHandle::new(Steps::new(1, &counters));

        handle.schedule_from_now_secs(60.0);
        assert!(!handle.is_eligible(Instant::now()));

        handle.schedule_from_now_secs(-1.0);
        assert!(handle.is_eligible(Instant::now()));

        handle.schedule_from_now_secs(f64::NAN);
        assert!(handle.is_eligible(Instant::now()));

        handle.schedule_from_now_secs(f64::INFINITY);
        assert!(handle.scheduled_at() > Instant::now() + Duration::from_secs(3600));
    }

    #[test]
    fn test_huge_delay_stays_in_the_future() {
        let counters = Counters::default();
        let handle = TaskHandle::new(Steps::new(1, &counters));

        handle.schedule_after(Duration::MAX);
        assert!(!handle.is_eligible(Instant::now()));
        assert!(handle.scheduled_at() > Instant::now() + Duration::from_secs(3600));
    }

    #[test]
    fn test_nan_priority_is_sanitized() {
        let counters = Counters::default();
        let handle = TaskHandle::new(Steps::new(1, &counters)).with_priority(f64::NAN);
        assert_eq!(handle.priority(), 0.0);
    }

    #[test]
    fn test_concurrent_run_now_executes_once() {
        let counters = Counters::default();
        let handle = TaskHandle::new(Steps::new(1, &counters));

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let handle = handle.clone();
                thread::spawn(move || handle.run_now(true))
            })
            .collect();

        for t in threads {
            assert!(t.join().unwrap());
        }

        assert_eq!(counters.bodies.load(Ordering::SeqCst), 1);
        assert_eq!(counters.finished.load(Ordering::SeqCst), 1);
    }

    struct Panicky;

    impl Task for Panicky {
        fn body(&self, _cx: &TaskContext<'_>, _cancel: &CancelToken) {
            panic!("encoder exploded");
        }
    }

    #[test]
    fn test_panicking_body_is_forced_done() {
        let handle = TaskHandle::new(Panicky);
        assert!(handle.run_now(true));
        assert!(handle.is_done());
        assert!(handle.is_canceled());
    }

    struct SelfForcing {
        result: Arc<Mutex<Option<bool>>>,
    }

    impl Task for SelfForcing {
        fn body(&self, cx: &TaskContext<'_>, _cancel: &CancelToken) {
            *self.result.lock() = Some(cx.handle().run_now(true));
            cx.set_finished();
        }
    }

    #[test]
    fn test_run_now_from_own_body_is_noop() {
        let result = Arc::new(Mutex::new(None));
        let handle = TaskHandle::new(SelfForcing {
            result: result.clone(),
        });

        assert!(handle.run_now(true));
        assert_eq!(*result.lock(), Some(false));
    }
}
