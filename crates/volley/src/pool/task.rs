//! Task, promise and future.
//!
//! A [`Task`] owns the submitted closure and the write side of a one-shot slot;
//! the caller keeps the read side as a [`TaskFuture`]. Panics inside the closure
//! are captured into the slot and only surface from [`TaskFuture::get`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Outcome of a bounded wait on a [`TaskFuture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureStatus {
    Ready,
    Timeout,
}

enum Slot<T> {
    Pending,
    Ready(Result<T>),
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        // The slot is only ever swapped whole, so a poisoned lock still holds a valid value.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Write side of the slot. Dropping it unfulfilled resolves the future with
/// [`Error::Abandoned`].
struct Promise<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Promise<T> {
    fn fulfil(mut self, value: Result<T>) {
        if let Some(shared) = self.shared.take() {
            *shared.lock() = Slot::Ready(value);
            shared.ready.notify_all();
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let mut slot = shared.lock();
            if matches!(*slot, Slot::Pending) {
                *slot = Slot::Ready(Err(Error::Abandoned));
            }
            drop(slot);
            shared.ready.notify_all();
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A queued unit of work.
pub(crate) struct Task {
    run: Box<dyn FnOnce() + Send>,
}

impl Task {
    pub(crate) fn new<F, T>(f: F) -> (Self, TaskFuture<T>)
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Pending),
            ready: Condvar::new(),
        });
        let promise = Promise {
            shared: Some(Arc::clone(&shared)),
        };
        let task = Task {
            run: Box::new(move || {
                let outcome = catch_unwind(AssertUnwindSafe(f))
                    .map_err(|payload| Error::TaskPanicked(panic_message(payload)));
                promise.fulfil(outcome);
            }),
        };
        (
            task,
            TaskFuture {
                shared: Some(shared),
            },
        )
    }

    pub(crate) fn run(self) {
        (self.run)()
    }
}

/// Read side of a submitted task.
///
/// Behaves like a one-shot future: [`get`](Self::get) consumes the value and
/// leaves the future invalid.
#[must_use = "dropping a TaskFuture discards the task's result"]
pub struct TaskFuture<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Default for TaskFuture<T> {
    fn default() -> Self {
        Self { shared: None }
    }
}

impl<T> std::fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFuture")
            .field("valid", &self.valid())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl<T> TaskFuture<T> {
    pub fn valid(&self) -> bool {
        self.shared.is_some()
    }

    /// True once the task has finished (or been discarded).
    pub fn is_ready(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|s| matches!(*s.lock(), Slot::Ready(_)))
    }

    fn shared(&self) -> Result<&Arc<Shared<T>>> {
        self.shared.as_ref().ok_or(Error::InvalidFuture)
    }

    /// Block until the task has finished.
    pub fn wait(&self) -> Result<()> {
        let shared = self.shared()?;
        let mut slot = shared.lock();
        while matches!(*slot, Slot::Pending) {
            slot = shared
                .ready
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        Ok(())
    }

    pub fn wait_for(&self, timeout: Duration) -> Result<FutureStatus> {
        self.wait_until(Instant::now() + timeout)
    }

    pub fn wait_until(&self, deadline: Instant) -> Result<FutureStatus> {
        let shared = self.shared()?;
        let mut slot = shared.lock();
        loop {
            if matches!(*slot, Slot::Ready(_)) {
                return Ok(FutureStatus::Ready);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(FutureStatus::Timeout);
            }
            slot = shared
                .ready
                .wait_timeout(slot, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Block for the result and take it. Any later call fails with
    /// [`Error::InvalidFuture`].
    pub fn get(&mut self) -> Result<T> {
        self.wait()?;
        let shared = self.shared.take().ok_or(Error::InvalidFuture)?;
        let mut slot = shared.lock();
        match std::mem::replace(&mut *slot, Slot::Pending) {
            Slot::Ready(value) => value,
            Slot::Pending => Err(Error::InvalidFuture),
        }
    }
}
