//! Ready-made tasks built from closures.
//!
//! [`RepeatingTask`] calls a closure on every `body` call until it says stop.
//! [`OneShotTask`] runs a closure once and delivers its result through a
//! [`Completion`], which reports [`Error::Canceled`] if the task ends without
//! running.

use super::handle::TaskHandle;
use super::task::{CancelToken, Task, TaskContext};
use crate::error::{Error, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;

/// What a repeating closure wants after a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Run again as soon as a worker is free.
    Continue,
    /// Run again once the delay has passed.
    After(Duration),
    Stop,
}

pub struct RepeatingTask<F> {
    name: String,
    step: Mutex<F>,
}

impl<F> RepeatingTask<F>
where
    F: FnMut(&CancelToken) -> Repeat + Send + 'static,
{
    pub fn new(name: impl Into<String>, step: F) -> Self {
        Self {
            name: name.into(),
            step: Mutex::new(step),
        }
    }
}

impl<F> Task for RepeatingTask<F>
where
    F: FnMut(&CancelToken) -> Repeat + Send + 'static,
{
    fn body(&self, cx: &TaskContext<'_>, cancel: &CancelToken) {
        let next = {
            let mut step = self.step.lock();
            (*step)(cancel)
        };
        match next {
            Repeat::Continue => {}
            Repeat::After(delay) => cx.schedule_after(delay),
            Repeat::Stop => cx.set_finished(),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for RepeatingTask<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepeatingTask")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

type Job<T> = Box<dyn FnOnce(&CancelToken) -> T + Send>;

/// Runs a closure once. The result goes to the paired [`Completion`].
pub struct OneShotTask<T> {
    name: String,
    job: Mutex<Option<Job<T>>>,
    result: Mutex<Option<Sender<T>>>,
}

impl<T: Send + 'static> OneShotTask<T> {
    pub fn new<F>(name: impl Into<String>, job: F) -> (Self, Completion<T>)
    where
        F: FnOnce(&CancelToken) -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let task = Self {
            name: name.into(),
            job: Mutex::new(Some(Box::new(job))),
            result: Mutex::new(Some(tx)),
        };
        (task, Completion { rx })
    }
}

impl<T: Send + 'static> Task for OneShotTask<T> {
    fn body(&self, cx: &TaskContext<'_>, cancel: &CancelToken) {
        let Some(job) = self.job.lock().take() else {
            cx.set_finished();
            return;
        };

        let value = job(cancel);
        if let Some(tx) = self.result.lock().take() {
            // the receiver may be gone, nobody is waiting then
            let _ = tx.send(value);
        }
        cx.set_finished();
    }

    fn canceled(&self) {
        self.result.lock().take();
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<T> fmt::Debug for OneShotTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneShotTask")
            .field("name", &self.name)
            .field("pending", &self.job.lock().is_some())
            .finish()
    }
}

/// Receiving end of a [`OneShotTask`].
#[derive(Debug)]
pub struct Completion<T> {
    rx: Receiver<T>,
}

impl<T> Completion<T> {
    /// Blocks until the task produced its value, or fails with
    /// [`Error::Canceled`] if the task ended without producing one.
    pub fn wait(self) -> Result<T> {
        self.rx.recv().map_err(|_| Error::Canceled)
    }

    /// `Ok(None)` on timeout. The completion stays usable afterwards.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Ok(Some(value)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Canceled),
        }
    }

    pub fn try_get(&self) -> Result<Option<T>> {
        match self.rx.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Canceled),
        }
    }
}

/// Wraps a repeating closure in a handle.
#[track_caller]
pub fn repeating<F>(name: impl Into<String>, step: F) -> TaskHandle
where
    F: FnMut(&CancelToken) -> Repeat + Send + 'static,
{
    TaskHandle::new(RepeatingTask::new(name, step))
}

/// Wraps a one-shot closure in a handle, eligible immediately.
#[track_caller]
pub fn once<T, F>(name: impl Into<String>, job: F) -> (TaskHandle, Completion<T>)
where
    T: Send + 'static,
    F: FnOnce(&CancelToken) -> T + Send + 'static,
{
    let (task, completion) = OneShotTask::new(name, job);
    (TaskHandle::new(task), completion)
}

/// Like [`once`], but not eligible before `delay` has passed.
#[track_caller]
pub fn once_after<T, F>(
    name: impl Into<String>,
    delay: Duration,
    job: F,
) -> (TaskHandle, Completion<T>)
where
    T: Send + 'static,
    F: FnOnce(&CancelToken) -> T + Send + 'static,
{
    let (handle, completion) = once(name, job);
    handle.schedule_after(delay);
    (handle, completion)
}
