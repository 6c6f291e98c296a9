//! Worker threads and the accepting / draining / stopped lifecycle.

use super::core::{Lifecycle, Scheduler, Shared};
use crate::error::{Error, Result};
use crate::executor::worker::{self, Worker};
use crate::executor::TaskHandle;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

const MAX_WORKERS: usize = 1024;

impl Shared {
    /// Blocks a worker until it can reserve a task. `None` tells the worker
    /// to exit: the pool stopped or has more workers than it wants.
    pub(crate) fn wait_for_task(&self) -> Option<TaskHandle> {
        let mut state = self.state.lock();
        loop {
            if state.lifecycle == Lifecycle::Draining && state.queue.is_empty() {
                state.lifecycle = Lifecycle::Stopped;
                state.target_workers = 0;
                tracing::debug!("pool drained, stopping");
                self.work_available.notify_all();
            }

            if state.live_workers > state.target_workers {
                state.live_workers -= 1;
                return None;
            }

            let now = Instant::now();
            if let Some(task) = state.queue.pick(now) {
                return Some(task);
            }

            let mut timeout = self.config.idle_timeout;
            if let Some(due) = state.queue.next_due() {
                timeout = timeout.min(due.saturating_duration_since(now));
            }
            self.work_available.wait_for(&mut state, timeout);
        }
    }
}

impl Scheduler {
    /// Makes exactly `n` workers live, spawning or retiring as needed, and
    /// puts the pool back into the accepting state. Works after `shutdown`
    /// and `stop_when_done` too.
    pub fn run(&self, n: usize) -> Result<()> {
        if n == 0 || n > MAX_WORKERS {
            return Err(Error::config(format!(
                "worker count must be in 1..={}, got {}",
                MAX_WORKERS, n
            )));
        }

        // retired workers are gone already, their handles only take space
        self.shared.workers.lock().retain(|handle| !handle.is_finished());

        let spawn = {
            let mut state = self.shared.state.lock();
            state.lifecycle = Lifecycle::Accepting;
            state.target_workers = n;
            let spawn = n.saturating_sub(state.live_workers);
            state.live_workers += spawn;
            spawn
        };
        self.shared.work_available.notify_all();

        for started in 0..spawn {
            if let Err(e) = self.spawn_worker() {
                let mut state = self.shared.state.lock();
                state.live_workers -= spawn - started;
                return Err(e);
            }
        }

        tracing::debug!(workers = n, spawned = spawn, "pool running");
        Ok(())
    }

    fn spawn_worker(&self) -> Result<()> {
        let config = &self.shared.config;
        let id = self.shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", config.thread_name_prefix, id);

        let mut builder = thread::Builder::new().name(name);
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let shared = Arc::clone(&self.shared);
        let handle = builder
            .spawn(move || Worker::new(id, shared).run())
            .map_err(|e| Error::executor(format!("spawn failed: {}", e)))?;

        self.shared.workers.lock().push(handle);
        Ok(())
    }

    /// Stops the pool.
    ///
    /// Queued tasks are canceled and dropped (their `canceled` hook fires),
    /// then this blocks until every reserved or running task has been handed
    /// back, and joins the workers. Tasks added afterwards are canceled
    /// without running. Calling it again is a no-op.
    ///
    /// Must not be called while the calling thread holds a
    /// [`Reservation`](crate::executor::Reservation) from this scheduler.
    pub fn shutdown(&self) {
        let shared = &self.shared;

        let drained = {
            let mut state = shared.state.lock();
            let was = state.lifecycle;
            state.lifecycle = Lifecycle::Stopped;
            state.target_workers = 0;

            let drained = state.queue.drain_queued();
            for task in &drained {
                task.set_canceled();
                task.clear_owner();
            }
            shared.work_available.notify_all();

            // a task shutting down its own pool is still in flight
            let own = worker::held_task()
                .map_or(0, |id| usize::from(state.queue.is_in_flight(id)));
            while state.queue.in_flight() > own {
                shared.task_released.wait(&mut state);
            }

            if was != Lifecycle::Stopped {
                tracing::info!(canceled = drained.len(), "scheduler shutting down");
            }
            drained
        };

        for task in &drained {
            shared.finalize_detached(task);
        }

        self.join();
    }

    /// Lets the pool run out of work: it keeps executing (and accepting)
    /// tasks, and stops once it owns none. Does not block; see
    /// [`join`](Scheduler::join).
    pub fn stop_when_done(&self) {
        let mut state = self.shared.state.lock();
        if state.lifecycle != Lifecycle::Accepting {
            return;
        }

        if state.queue.is_empty() {
            state.lifecycle = Lifecycle::Stopped;
            state.target_workers = 0;
        } else {
            state.lifecycle = Lifecycle::Draining;
        }
        drop(state);

        tracing::debug!("pool draining");
        self.shared.work_available.notify_all();
    }

    /// Waits for the worker threads to exit. A worker calling this skips its
    /// own thread.
    ///
    /// Blocks forever on a pool that was neither stopped nor told to drain.
    pub fn join(&self) {
        let current = thread::current().id();
        let handles = {
            let mut workers = self.shared.workers.lock();
            let (own, others): (Vec<_>, Vec<_>) = workers
                .drain(..)
                .partition(|handle| handle.thread().id() == current);
            *workers = own;
            others
        };

        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }

    /// Workers currently serving the pool.
    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().live_workers
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().lifecycle == Lifecycle::Stopped
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.state.lock().lifecycle
    }
}
