//! Boundary to the network layer.
//!
//! [`Transport`] executes one transfer in three phases (prepare, perform,
//! complete). The perform phase is a self-contained [`Transfer`] future so
//! that a [`Multiplexer`] can advance many of them on one thread and report
//! completions by [`SessionKey`].

mod http;
mod multiplex;

pub use http::HttpTransport;
pub use multiplex::AsyncMultiplexer;

use std::future::Future;
use std::pin::Pin;
use std::thread;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::multi::SessionKey;
use crate::request::{DownloadSink, Method, Request};
use crate::response::{ErrorCode, ErrorInfo, Response};
use crate::session::SharedSession;

/// The perform phase of one transfer. Owns everything it touches, so it can
/// outlive the borrow of its transport.
pub type Transfer = Pin<Box<dyn Future<Output = ErrorInfo> + Send + 'static>>;

/// A single-transfer HTTP primitive.
///
/// One instance runs one transfer at a time; callers serialise access.
pub trait Transport: Send {
    /// Configure the next transfer without doing any I/O.
    ///
    /// A sink must be given exactly when `method` is [`Method::Download`].
    fn prepare(&mut self, request: &Request, method: Method, sink: Option<DownloadSink>)
    -> Result<()>;

    /// Take the prepared transfer. The future resolves with
    /// [`ErrorCode::AbortedByCallback`] as soon as `cancel` fires, whether it
    /// is connecting, waiting for headers or between body chunks.
    fn transfer(&mut self, cancel: CancellationToken) -> Transfer;

    /// Run the prepared transfer to completion on the calling thread.
    fn perform(&mut self, cancel: &CancellationToken) -> ErrorInfo {
        let transfer = self.transfer(cancel.clone());
        outside_runtime(move || match transfer_runtime() {
            Ok(runtime) => runtime.block_on(transfer),
            Err(e) => ErrorInfo::new(
                ErrorCode::Unknown,
                format!("failed to start transfer runtime: {e}"),
            ),
        })
    }

    /// Build the response of the last transfer.
    fn complete(&mut self, outcome: ErrorInfo) -> Response;
}

/// Drives many prepared sessions concurrently on behalf of a
/// [`MultiDriver`](crate::MultiDriver).
pub trait Multiplexer: Send {
    /// Register a prepared session. Adding a key twice is a no-op.
    fn add(&mut self, key: SessionKey, session: SharedSession) -> Result<()>;

    /// Forget a session. Its completion, if any, is never reported.
    fn remove(&mut self, key: SessionKey);

    /// Advance every transfer without blocking; returns how many are still running.
    fn perform(&mut self) -> Result<usize>;

    /// Wait at most `timeout` for any transfer to make progress.
    fn poll(&mut self, timeout: Duration) -> Result<()>;

    /// Next finished transfer, if any.
    fn info_read(&mut self) -> Option<(SessionKey, ErrorInfo)>;
}

/// Single-threaded runtime that transfers are driven on.
pub(crate) fn transfer_runtime() -> std::io::Result<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .thread_name("volley-transfer")
        .build()
}

/// Run `f` where blocking on a runtime is allowed. A caller that is itself
/// inside an async runtime gets a scoped helper thread.
pub(crate) fn outside_runtime<R: Send>(f: impl FnOnce() -> R + Send) -> R {
    if Handle::try_current().is_err() {
        return f();
    }
    thread::scope(|scope| match scope.spawn(f).join() {
        Ok(value) => value,
        Err(panic) => std::panic::resume_unwind(panic),
    })
}
