//! Multiplexer that advances every transfer on the calling thread.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use super::{Multiplexer, outside_runtime, transfer_runtime};
use crate::error::{Error, Result};
use crate::multi::SessionKey;
use crate::response::{ErrorCode, ErrorInfo};
use crate::session::{SharedSession, lock_session};

type Completion = (SessionKey, ErrorInfo);

/// [`Multiplexer`] over [`Transfer`](super::Transfer) futures.
///
/// All transfers share one current-thread runtime that only runs inside
/// `perform` and `poll`; no thread is spawned per session. Transfers start on
/// the first `perform` or `poll` after they are added.
pub struct AsyncMultiplexer {
    cancel: CancellationToken,
    runtime: Option<Runtime>,
    inflight: FuturesUnordered<BoxFuture<'static, Completion>>,
    /// Keys whose completion is still wanted, with the token that aborts them.
    active: HashMap<SessionKey, CancellationToken>,
    completed: VecDeque<Completion>,
}

impl Default for AsyncMultiplexer {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl AsyncMultiplexer {
    /// Every transfer runs under a child of `cancel`.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            runtime: None,
            inflight: FuturesUnordered::new(),
            active: HashMap::new(),
            completed: VecDeque::new(),
        }
    }

    /// Wait up to `timeout` for one completion, then collect every other
    /// transfer that is already done.
    fn turn(&mut self, timeout: Duration) -> Result<()> {
        let runtime = ensure_runtime(&mut self.runtime)?;
        let inflight = &mut self.inflight;
        let done = outside_runtime(|| {
            runtime.block_on(async {
                let mut done = Vec::new();
                if let Ok(Some(first)) = tokio::time::timeout(timeout, inflight.next()).await {
                    done.push(first);
                    while let Some(Some(next)) = inflight.next().now_or_never() {
                        done.push(next);
                    }
                }
                done
            })
        });
        for completion in done {
            self.accept(completion);
        }
        Ok(())
    }

    fn accept(&mut self, (key, outcome): Completion) {
        if self.active.remove(&key).is_some() {
            self.completed.push_back((key, outcome));
        } else {
            tracing::trace!(key = %key, "Dropping completion of removed transfer");
        }
    }
}

fn ensure_runtime(slot: &mut Option<Runtime>) -> Result<&Runtime> {
    if slot.is_none() {
        let runtime = transfer_runtime()
            .map_err(|e| Error::Multiplex(format!("failed to start transfer runtime: {e}")))?;
        *slot = Some(runtime);
    }
    slot.as_ref()
        .ok_or_else(|| Error::Multiplex("transfer runtime unavailable".to_string()))
}

impl Multiplexer for AsyncMultiplexer {
    fn add(&mut self, key: SessionKey, session: SharedSession) -> Result<()> {
        if self.active.contains_key(&key) {
            return Ok(());
        }
        let cancel = self.cancel.child_token();
        let transfer = lock_session(&session).start_transfer(cancel.clone());
        self.inflight.push(
            AssertUnwindSafe(transfer)
                .catch_unwind()
                .map(move |outcome| {
                    let info = outcome.unwrap_or_else(|_| {
                        tracing::error!(key = %key, "Transfer panicked");
                        ErrorInfo::new(ErrorCode::Unknown, "transfer panicked")
                    });
                    (key, info)
                })
                .boxed(),
        );
        self.active.insert(key, cancel);
        Ok(())
    }

    fn remove(&mut self, key: SessionKey) {
        self.completed.retain(|(k, _)| *k != key);
        if let Some(cancel) = self.active.remove(&key) {
            cancel.cancel();
        }
    }

    fn perform(&mut self) -> Result<usize> {
        if !self.inflight.is_empty() {
            self.turn(Duration::ZERO)?;
        }
        Ok(self.active.len())
    }

    fn poll(&mut self, timeout: Duration) -> Result<()> {
        if self.active.is_empty() {
            return Ok(());
        }
        self.turn(timeout)
    }

    fn info_read(&mut self) -> Option<(SessionKey, ErrorInfo)> {
        self.completed.pop_front()
    }
}

impl Drop for AsyncMultiplexer {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.inflight.clear();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
