//! Cancellable handle over a pool task.
//!
//! The handle pairs a [`TaskFuture`] with a [`CancellationToken`] that the
//! task observes. Cancelling only sets the token. A running HTTP transfer
//! aborts at once, even while connecting or waiting on a silent server.
//! Work that has not started skips itself.
//!
//! Once the token is set, every result access fails with
//! [`Error::Cancelled`], even if the task finished first.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::pool::{FutureStatus, TaskFuture, ThreadPool};
use crate::response::Response;

/// Result of [`CancellableHandle::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum CancellationResult {
    Failure,
    Success,
    /// The handle is invalid or was already cancelled.
    InvalidOperation,
}

/// Future-like handle whose task can be asked to stop.
///
/// Dropping the handle cancels the task.
#[must_use = "dropping a CancellableHandle cancels its task"]
pub struct CancellableHandle<T> {
    future: TaskFuture<Result<T>>,
    token: Option<CancellationToken>,
}

/// Handle returned by the asynchronous session verbs.
pub type AsyncResponse = CancellableHandle<Response>;

impl<T> Default for CancellableHandle<T> {
    fn default() -> Self {
        Self {
            future: TaskFuture::default(),
            token: None,
        }
    }
}

impl<T> std::fmt::Debug for CancellableHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellableHandle")
            .field("valid", &self.valid())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl<T> CancellableHandle<T> {
    pub(crate) fn new(future: TaskFuture<Result<T>>, token: CancellationToken) -> Self {
        Self {
            future,
            token: Some(token),
        }
    }

    pub fn valid(&self) -> bool {
        self.future.valid()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(|t| t.is_cancelled())
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !self.future.valid() {
            return Err(Error::InvalidFuture);
        }
        Ok(())
    }

    /// Block for the result. Fails with [`Error::Cancelled`] once cancelled
    /// and with [`Error::InvalidFuture`] after a previous `get`.
    pub fn get(&mut self) -> Result<T> {
        self.check()?;
        self.future.get()?
    }

    pub fn wait(&self) -> Result<()> {
        self.check()?;
        self.future.wait()
    }

    pub fn wait_for(&self, timeout: Duration) -> Result<FutureStatus> {
        self.check()?;
        self.future.wait_for(timeout)
    }

    pub fn wait_until(&self, deadline: Instant) -> Result<FutureStatus> {
        self.check()?;
        self.future.wait_until(deadline)
    }

    /// Request cancellation. Only the first call on a valid handle succeeds.
    pub fn cancel(&self) -> CancellationResult {
        match &self.token {
            Some(token) if self.future.valid() && !token.is_cancelled() => {
                token.cancel();
                tracing::debug!("Handle cancelled");
                CancellationResult::Success
            }
            _ => CancellationResult::InvalidOperation,
        }
    }

    /// Token observed by the task, for cancelling several handles together.
    pub fn token(&self) -> Option<&CancellationToken> {
        self.token.as_ref()
    }
}

impl<T> Drop for CancellableHandle<T> {
    fn drop(&mut self) {
        if let Some(token) = &self.token {
            token.cancel();
        }
    }
}

impl ThreadPool {
    /// Submit work that receives a fresh cancellation token.
    ///
    /// If the token is already set when a worker picks the task up, `f` is not
    /// run and the task resolves to [`Error::Cancelled`].
    pub fn submit_cancellable<F, T>(&self, f: F) -> CancellableHandle<T>
    where
        F: FnOnce(CancellationToken) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit_with_token(CancellationToken::new(), f)
    }

    /// Like [`submit_cancellable`](Self::submit_cancellable) with a caller
    /// supplied token, typically a child of a batch token.
    pub fn submit_with_token<F, T>(&self, token: CancellationToken, f: F) -> CancellableHandle<T>
    where
        F: FnOnce(CancellationToken) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let task_token = token.clone();
        let future = self.submit(move || {
            if task_token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            f(task_token)
        });
        CancellableHandle::new(future, token)
    }
}
