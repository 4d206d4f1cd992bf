//! Scripted transport double shared by the unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::request::{DownloadSink, Method, Request};
use crate::response::{ErrorCode, ErrorInfo, Response};
use crate::transport::{Transfer, Transport};

/// One-shot flag a test can block on.
#[derive(Default)]
pub(crate) struct Latch {
    set: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub(crate) fn open(&self) {
        *self.set.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut set = self.set.lock().unwrap();
        while !*set {
            set = self.cv.wait(set).unwrap();
        }
    }
}

#[derive(Default)]
struct State {
    url: String,
    method: Option<Method>,
    sink: Option<DownloadSink>,
    downloaded: u64,
    ran_on: Option<ThreadId>,
}

/// Returns a fixed status and body, echoing the method in `x-method`.
///
/// Clones share counters and state: give every session its own `new()`.
#[derive(Clone)]
pub(crate) struct ScriptedTransport {
    status: u16,
    body: String,
    delay: Duration,
    pub(crate) calls: Arc<AtomicUsize>,
    pub(crate) started: Arc<Latch>,
    pub(crate) last_outcome: Arc<Mutex<Option<ErrorCode>>>,
    state: Arc<Mutex<State>>,
}

impl ScriptedTransport {
    pub(crate) fn new(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            started: Arc::new(Latch::default()),
            last_outcome: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Thread the last transfer ran on.
    pub(crate) fn ran_on(&self) -> Option<ThreadId> {
        self.state.lock().unwrap().ran_on
    }

    fn deliver(&self) -> ErrorInfo {
        let mut state = self.state.lock().unwrap();
        let accepted = match state.sink.as_mut() {
            Some(sink) => sink.accept(self.body.as_bytes()),
            None => true,
        };
        if !accepted {
            return ErrorInfo::new(ErrorCode::WriteError, "sink refused data");
        }
        if state.sink.is_some() {
            state.downloaded = self.body.len() as u64;
        }
        ErrorInfo::ok()
    }
}

impl Transport for ScriptedTransport {
    fn prepare(
        &mut self,
        request: &Request,
        method: Method,
        sink: Option<DownloadSink>,
    ) -> Result<()> {
        if method.is_download() != sink.is_some() {
            return Err(Error::invalid("download and sink must be used together"));
        }
        *self.state.lock().unwrap() = State {
            url: request.url.clone(),
            method: Some(method),
            sink,
            ..Default::default()
        };
        Ok(())
    }

    fn transfer(&mut self, cancel: CancellationToken) -> Transfer {
        let this = self.clone();
        Box::pin(async move {
            this.calls.fetch_add(1, Ordering::SeqCst);
            this.state.lock().unwrap().ran_on = Some(thread::current().id());
            this.started.open();

            let info = tokio::select! {
                biased;
                () = cancel.cancelled() => ErrorInfo::new(ErrorCode::AbortedByCallback, "cancelled"),
                () = tokio::time::sleep(this.delay) => this.deliver(),
            };
            *this.last_outcome.lock().unwrap() = Some(info.code);
            info
        })
    }

    fn complete(&mut self, outcome: ErrorInfo) -> Response {
        let mut state = self.state.lock().unwrap();
        let ok = outcome.is_ok();
        let is_download = state.sink.take().is_some();
        let method = state.method.take().map(|m| m.to_string()).unwrap_or_default();
        Response {
            status_code: if ok { self.status } else { 0 },
            text: if ok && !is_download {
                self.body.clone()
            } else {
                String::new()
            },
            headers: BTreeMap::from([("x-method".to_string(), method)]),
            url: std::mem::take(&mut state.url),
            elapsed: 0.0,
            error: outcome,
            downloaded_bytes: std::mem::take(&mut state.downloaded),
        }
    }
}
