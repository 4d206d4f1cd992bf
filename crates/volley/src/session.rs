//! Single-request session: request configuration, a transport and an
//! interceptor chain.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::handle::AsyncResponse;
use crate::interceptor::{Chain, Interceptor, InterceptorChain, Target};
use crate::pool::ThreadPool;
use crate::request::{DownloadSink, Method, Request};
use crate::response::{ErrorInfo, Response};
use crate::transport::{HttpTransport, Transfer, Transport};

/// Session shared with a [`MultiDriver`](crate::MultiDriver).
pub type SharedSession = Arc<Mutex<Session>>;

pub(crate) fn lock_session(session: &SharedSession) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Session mutex poisoned - recovering");
        poisoned.into_inner()
    })
}

/// One logical HTTP request plus the machinery to run it.
///
/// The verbs (`get`, `post`, ...) run the interceptor chain on the calling
/// thread; the `*_async` verbs move the session onto a [`ThreadPool`].
pub struct Session {
    request: Request,
    transport: Box<dyn Transport>,
    interceptors: InterceptorChain<Session>,
    cancel: CancellationToken,
    pending_method: Option<Method>,
    pending_sink: Option<DownloadSink>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("request", &self.request)
            .field("interceptors", &self.interceptors)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Session {
    /// Session backed by the default reqwest transport.
    pub fn new() -> Self {
        Self::with_transport(HttpTransport::default())
    }

    pub fn with_transport(transport: impl Transport + 'static) -> Self {
        Self {
            request: Request::default(),
            transport: Box::new(transport),
            interceptors: InterceptorChain::new(),
            cancel: CancellationToken::new(),
            pending_method: None,
            pending_sink: None,
        }
    }

    pub fn from_request(request: Request) -> Self {
        Self::new().with_request(request)
    }

    pub fn with_request(mut self, request: Request) -> Self {
        self.request = request;
        self
    }

    /// Wrap for use in a [`MultiDriver`](crate::MultiDriver).
    pub fn shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.request.url = url.into();
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn add_interceptor(&mut self, interceptor: impl Interceptor<Session> + 'static) {
        self.interceptors.add(interceptor);
    }

    pub fn add_interceptor_fn<F>(&mut self, f: F)
    where
        F: Fn(&mut Chain<'_, Session>) -> Result<Response> + Send + Sync + 'static,
    {
        self.interceptors.add_fn(f);
    }

    pub fn interceptors(&self) -> &InterceptorChain<Session> {
        &self.interceptors
    }

    /// Token that aborts the transfer of a synchronous verb.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    /// Method of the call currently running through the chain.
    pub fn pending_method(&self) -> Option<Method> {
        self.pending_method
    }

    pub fn get(&mut self) -> Result<Response> {
        self.execute(Method::Get, None)
    }

    pub fn post(&mut self) -> Result<Response> {
        self.execute(Method::Post, None)
    }

    pub fn put(&mut self) -> Result<Response> {
        self.execute(Method::Put, None)
    }

    pub fn delete(&mut self) -> Result<Response> {
        self.execute(Method::Delete, None)
    }

    pub fn patch(&mut self) -> Result<Response> {
        self.execute(Method::Patch, None)
    }

    pub fn head(&mut self) -> Result<Response> {
        self.execute(Method::Head, None)
    }

    pub fn options(&mut self) -> Result<Response> {
        self.execute(Method::Options, None)
    }

    /// GET whose body is streamed into `sink` instead of [`Response::text`].
    pub fn download(&mut self, sink: DownloadSink) -> Result<Response> {
        self.execute(Method::Download, Some(sink))
    }

    /// Run `method`. Downloads go through [`download`](Self::download).
    pub fn perform(&mut self, method: Method) -> Result<Response> {
        if method.is_download() {
            return Err(Error::invalid("download requires a sink; use download()"));
        }
        self.execute(method, None)
    }

    fn execute(&mut self, method: Method, sink: Option<DownloadSink>) -> Result<Response> {
        self.pending_method = Some(method);
        self.pending_sink = sink;
        let chain = self.interceptors.clone();
        let result = chain.run(self);
        self.pending_method = None;
        self.pending_sink = None;
        result
    }

    pub fn get_async(self, pool: &ThreadPool) -> AsyncResponse {
        self.spawn(pool, Method::Get, None)
    }

    pub fn post_async(self, pool: &ThreadPool) -> AsyncResponse {
        self.spawn(pool, Method::Post, None)
    }

    pub fn put_async(self, pool: &ThreadPool) -> AsyncResponse {
        self.spawn(pool, Method::Put, None)
    }

    pub fn delete_async(self, pool: &ThreadPool) -> AsyncResponse {
        self.spawn(pool, Method::Delete, None)
    }

    pub fn patch_async(self, pool: &ThreadPool) -> AsyncResponse {
        self.spawn(pool, Method::Patch, None)
    }

    pub fn head_async(self, pool: &ThreadPool) -> AsyncResponse {
        self.spawn(pool, Method::Head, None)
    }

    pub fn options_async(self, pool: &ThreadPool) -> AsyncResponse {
        self.spawn(pool, Method::Options, None)
    }

    pub fn download_async(self, pool: &ThreadPool, sink: DownloadSink) -> AsyncResponse {
        self.spawn(pool, Method::Download, Some(sink))
    }

    pub fn perform_async(self, pool: &ThreadPool, method: Method) -> AsyncResponse {
        self.spawn(pool, method, None)
    }

    /// The handle's token replaces the session's own, so cancelling or
    /// dropping the handle aborts the transfer in whatever phase it is in.
    fn spawn(mut self, pool: &ThreadPool, method: Method, sink: Option<DownloadSink>) -> AsyncResponse {
        pool.submit_cancellable(move |token| {
            self.cancel = token;
            match sink {
                Some(sink) => self.download(sink),
                None => self.perform(method),
            }
        })
    }

    pub(crate) fn prepare_transfer(
        &mut self,
        method: Method,
        sink: Option<DownloadSink>,
    ) -> Result<()> {
        self.transport.prepare(&self.request, method, sink)
    }

    pub(crate) fn start_transfer(&mut self, cancel: CancellationToken) -> Transfer {
        self.transport.transfer(cancel)
    }

    pub(crate) fn complete_transfer(&mut self, outcome: ErrorInfo) -> Response {
        self.transport.complete(outcome)
    }
}

impl Target for Session {
    type Output = Response;

    fn terminal(&mut self) -> Result<Response> {
        let method = self
            .pending_method
            .ok_or_else(|| Error::invalid("no method was requested"))?;
        let sink = self.pending_sink.take();
        self.prepare_transfer(method, sink)?;
        let outcome = self.transport.perform(&self.cancel);
        Ok(self.transport.complete(outcome))
    }
}

impl Chain<'_, Session> {
    /// Proceed with a different method than the one the caller used.
    pub fn proceed_with(&mut self, method: Method) -> Result<Response> {
        if method.is_download() {
            return Err(Error::invalid(
                "download requires a sink; use proceed_download()",
            ));
        }
        let session = self.target();
        session.pending_method = Some(method);
        session.pending_sink = None;
        self.proceed()
    }

    /// Proceed as a download into `sink`.
    pub fn proceed_download(&mut self, sink: DownloadSink) -> Result<Response> {
        let session = self.target();
        session.pending_method = Some(Method::Download);
        session.pending_sink = Some(sink);
        self.proceed()
    }
}
