//! Multiplex driver: runs a batch of sessions concurrently and returns their
//! responses in completion order.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::MultiConfig;
use crate::error::{Error, Result};
use crate::interceptor::{Chain, Interceptor, InterceptorChain, Target};
use crate::request::{DownloadSink, Method};
use crate::response::Response;
use crate::session::{SharedSession, lock_session};
use crate::transport::{AsyncMultiplexer, Multiplexer};

/// Identifies a session inside one driver and its multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey(Uuid);

impl SessionKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A session registered with a driver, tagged with the method it will run.
///
/// A download slot also holds its sink until the batch starts.
#[derive(Debug)]
pub struct SessionSlot {
    key: SessionKey,
    session: SharedSession,
    method: Option<Method>,
    sink: Option<DownloadSink>,
}

impl SessionSlot {
    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Tag the slot. A non-download method drops any sink left from
    /// [`MultiDriver::prepare_download`].
    pub fn set_method(&mut self, method: Method) {
        self.method = Some(method);
        if !method.is_download() {
            self.sink = None;
        }
    }
}

/// Runs many sessions at once through a [`Multiplexer`].
///
/// The slot list must not be changed while a batch is running. All slots of a
/// batch must agree on being downloads or not; this is checked when the batch
/// starts, not when sessions are added.
pub struct MultiDriver {
    slots: Vec<SessionSlot>,
    interceptors: InterceptorChain<MultiDriver>,
    multiplexer: Box<dyn Multiplexer>,
    cancel: CancellationToken,
    config: MultiConfig,
}

impl Default for MultiDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MultiDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiDriver")
            .field("slots", &self.slots.len())
            .field("interceptors", &self.interceptors)
            .field("config", &self.config)
            .finish()
    }
}

impl MultiDriver {
    pub fn new() -> Self {
        Self::with_config(MultiConfig::default())
    }

    pub fn with_config(config: MultiConfig) -> Self {
        let cancel = CancellationToken::new();
        let multiplexer = AsyncMultiplexer::new(cancel.child_token());
        Self {
            slots: Vec::new(),
            interceptors: InterceptorChain::new(),
            multiplexer: Box::new(multiplexer),
            cancel,
            config,
        }
    }

    /// Use a custom multiplexer. [`cancel`](Self::cancel) only reaches it if
    /// it was built from [`cancellation_token`](Self::cancellation_token).
    pub fn with_multiplexer(mut self, multiplexer: impl Multiplexer + 'static) -> Self {
        self.multiplexer = Box::new(multiplexer);
        self
    }

    pub fn add_session(&mut self, session: SharedSession) -> SessionKey {
        self.push_slot(session, None)
    }

    pub fn add_session_with(&mut self, session: SharedSession, method: Method) -> SessionKey {
        self.push_slot(session, Some(method))
    }

    fn push_slot(&mut self, session: SharedSession, method: Option<Method>) -> SessionKey {
        let key = SessionKey::new();
        self.slots.push(SessionSlot {
            key,
            session,
            method,
            sink: None,
        });
        key
    }

    /// Remove the slot holding `session`. Unknown sessions are ignored.
    pub fn remove_session(&mut self, session: &SharedSession) -> bool {
        let before = self.slots.len();
        self.slots.retain(|slot| !Arc::ptr_eq(&slot.session, session));
        before != self.slots.len()
    }

    pub fn remove_key(&mut self, key: SessionKey) -> bool {
        let before = self.slots.len();
        self.slots.retain(|slot| slot.key != key);
        before != self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[SessionSlot] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [SessionSlot] {
        &mut self.slots
    }

    pub fn add_interceptor(&mut self, interceptor: impl Interceptor<MultiDriver> + 'static) {
        self.interceptors.add(interceptor);
    }

    pub fn add_interceptor_fn<F>(&mut self, f: F)
    where
        F: Fn(&mut Chain<'_, MultiDriver>) -> Result<Vec<Response>> + Send + Sync + 'static,
    {
        self.interceptors.add_fn(f);
    }

    /// Abort every running and future transfer of this driver.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn get(&mut self) -> Result<Vec<Response>> {
        self.execute(Some(Method::Get))
    }

    pub fn post(&mut self) -> Result<Vec<Response>> {
        self.execute(Some(Method::Post))
    }

    pub fn put(&mut self) -> Result<Vec<Response>> {
        self.execute(Some(Method::Put))
    }

    pub fn delete(&mut self) -> Result<Vec<Response>> {
        self.execute(Some(Method::Delete))
    }

    pub fn patch(&mut self) -> Result<Vec<Response>> {
        self.execute(Some(Method::Patch))
    }

    pub fn head(&mut self) -> Result<Vec<Response>> {
        self.execute(Some(Method::Head))
    }

    pub fn options(&mut self) -> Result<Vec<Response>> {
        self.execute(Some(Method::Options))
    }

    /// Download every session, one sink per slot in slot order.
    pub fn download(&mut self, sinks: Vec<DownloadSink>) -> Result<Vec<Response>> {
        self.attach_sinks(sinks)?;
        self.execute(None)
    }

    /// Run the batch with each slot's own method tag.
    pub fn perform(&mut self) -> Result<Vec<Response>> {
        self.execute(None)
    }

    /// Turn slot `index` into a download into `sink`. The sink stays on the
    /// slot until a batch that passes validation hands it to the session.
    pub fn prepare_download(&mut self, index: usize, sink: DownloadSink) -> Result<()> {
        let slot = self.slots.get_mut(index).ok_or_else(|| {
            Error::invalid(format!("no session at index {index}"))
        })?;
        slot.method = Some(Method::Download);
        slot.sink = Some(sink);
        Ok(())
    }

    fn attach_sinks(&mut self, sinks: Vec<DownloadSink>) -> Result<()> {
        if sinks.len() != self.slots.len() {
            return Err(Error::invalid(format!(
                "{} download sinks given for {} sessions",
                sinks.len(),
                self.slots.len()
            )));
        }
        for (index, sink) in sinks.into_iter().enumerate() {
            self.prepare_download(index, sink)?;
        }
        Ok(())
    }

    fn set_method(&mut self, method: Method) {
        for slot in &mut self.slots {
            slot.set_method(method);
        }
    }

    fn execute(&mut self, method: Option<Method>) -> Result<Vec<Response>> {
        if let Some(method) = method {
            self.set_method(method);
        }
        let chain = self.interceptors.clone();
        chain.run(self)
    }

    fn check_methods(&self) -> Result<Vec<Method>> {
        let methods = self
            .slots
            .iter()
            .map(|slot| {
                slot.method
                    .ok_or_else(|| Error::invalid(format!("session {} has no method", slot.key)))
            })
            .collect::<Result<Vec<_>>>()?;
        let downloads = methods.iter().filter(|m| m.is_download()).count();
        if downloads != 0 && downloads != methods.len() {
            return Err(Error::invalid(
                "cannot mix download and non-download methods in one batch",
            ));
        }
        Ok(methods)
    }

    fn transfer_all(&mut self) -> Result<Vec<Response>> {
        if self.slots.is_empty() {
            return Ok(Vec::new());
        }
        let methods = self.check_methods()?;
        for (slot, method) in self.slots.iter_mut().zip(methods) {
            let sink = slot.sink.take();
            lock_session(&slot.session).prepare_transfer(method, sink)?;
        }

        let sessions: HashMap<SessionKey, SharedSession> = self
            .slots
            .iter()
            .map(|slot| (slot.key, Arc::clone(&slot.session)))
            .collect();
        for (key, session) in &sessions {
            self.multiplexer.add(*key, Arc::clone(session))?;
        }

        let result = self.drive(&sessions);
        for key in sessions.keys() {
            self.multiplexer.remove(*key);
        }
        result
    }

    fn drive(&mut self, sessions: &HashMap<SessionKey, SharedSession>) -> Result<Vec<Response>> {
        while self.multiplexer.perform()? > 0 {
            self.multiplexer.poll(self.config.poll_timeout)?;
        }

        let mut responses = Vec::with_capacity(sessions.len());
        while let Some((key, outcome)) = self.multiplexer.info_read() {
            match sessions.get(&key) {
                Some(session) => responses.push(lock_session(session).complete_transfer(outcome)),
                None => tracing::warn!(key = %key, "Completion for unknown session"),
            }
        }
        tracing::debug!(sessions = sessions.len(), completed = responses.len(), "Batch finished");
        Ok(responses)
    }
}

impl Target for MultiDriver {
    type Output = Vec<Response>;

    fn terminal(&mut self) -> Result<Vec<Response>> {
        self.transfer_all()
    }
}

impl Chain<'_, MultiDriver> {
    /// Proceed with `method` on every slot.
    pub fn proceed_with(&mut self, method: Method) -> Result<Vec<Response>> {
        if method.is_download() {
            return Err(Error::invalid(
                "download requires sinks; use proceed_download()",
            ));
        }
        self.target().set_method(method);
        self.proceed()
    }

    /// Proceed as a download, one sink per slot.
    pub fn proceed_download(&mut self, sinks: Vec<DownloadSink>) -> Result<Vec<Response>> {
        self.target().attach_sinks(sinks)?;
        self.proceed()
    }
}
