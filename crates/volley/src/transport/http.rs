//! HTTP transport on top of reqwest.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{Transfer, Transport};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::request::{Auth, DownloadSink, Method, Progress, Request};
use crate::response::{ErrorCode, ErrorInfo, Response};

/// How often the progress callback runs while no data arrives.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

struct Prepared {
    request: Request,
    method: Method,
    sink: Option<DownloadSink>,
}

#[derive(Default)]
struct Outcome {
    status: u16,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
    downloaded: u64,
    url: String,
    elapsed: f64,
}

/// Default [`Transport`]: one reqwest call per transfer.
///
/// Connections are not pooled across transfers, since each blocking
/// `perform` runs on a runtime of its own.
pub struct HttpTransport {
    config: ClientConfig,
    client: Option<reqwest::Client>,
    prepared: Option<Prepared>,
    outcome: Arc<Mutex<Outcome>>,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl HttpTransport {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            client: None,
            prepared: None,
            outcome: Arc::new(Mutex::new(Outcome::default())),
        }
    }

    fn client(&mut self) -> reqwest::Result<reqwest::Client> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .user_agent(self.config.user_agent.as_str())
            .pool_max_idle_per_host(0)
            .build()?;
        self.client = Some(client.clone());
        Ok(client)
    }
}

fn lock_outcome(outcome: &Mutex<Outcome>) -> MutexGuard<'_, Outcome> {
    outcome.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Transfer outcome mutex poisoned - recovering");
        poisoned.into_inner()
    })
}

impl Transport for HttpTransport {
    fn prepare(
        &mut self,
        request: &Request,
        method: Method,
        sink: Option<DownloadSink>,
    ) -> Result<()> {
        match (method.is_download(), sink.is_some()) {
            (true, false) => return Err(Error::invalid("download requires a sink")),
            (false, true) => {
                return Err(Error::invalid(format!(
                    "a download sink cannot be used with {method}"
                )));
            }
            _ => {}
        }
        self.prepared = Some(Prepared {
            request: request.clone(),
            method,
            sink,
        });
        *lock_outcome(&self.outcome) = Outcome {
            url: request.url.clone(),
            ..Default::default()
        };
        Ok(())
    }

    fn transfer(&mut self, cancel: CancellationToken) -> Transfer {
        let Some(prepared) = self.prepared.take() else {
            return Box::pin(async {
                ErrorInfo::new(ErrorCode::Unknown, "transport was not prepared")
            });
        };
        let client = match self.client() {
            Ok(client) => client,
            Err(e) => {
                let info =
                    ErrorInfo::new(ErrorCode::Unknown, format!("failed to build HTTP client: {e}"));
                return Box::pin(async move { info });
            }
        };
        let timeout = prepared.request.timeout.or(self.config.timeout);
        let outcome = Arc::clone(&self.outcome);

        Box::pin(async move {
            let started = Instant::now();
            let info = tokio::select! {
                biased;
                () = cancel.cancelled() => aborted(),
                info = fetch(client, prepared, timeout, &outcome) => info,
            };
            lock_outcome(&outcome).elapsed = started.elapsed().as_secs_f64();
            info
        })
    }

    fn complete(&mut self, outcome: ErrorInfo) -> Response {
        let done = std::mem::take(&mut *lock_outcome(&self.outcome));
        Response {
            status_code: done.status,
            text: String::from_utf8_lossy(&done.body).into_owned(),
            headers: done.headers,
            url: done.url,
            elapsed: done.elapsed,
            error: outcome,
            downloaded_bytes: done.downloaded,
        }
    }
}

async fn fetch(
    client: reqwest::Client,
    prepared: Prepared,
    timeout: Option<Duration>,
    outcome: &Mutex<Outcome>,
) -> ErrorInfo {
    let Prepared {
        request,
        method,
        mut sink,
    } = prepared;

    let upload_total = request.body.as_ref().map_or(0, |body| body.len() as u64);
    let mut progress = Progress {
        upload_total,
        ..Default::default()
    };
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let send = build(&client, &request, method, timeout).send();
    tokio::pin!(send);
    let mut response = loop {
        tokio::select! {
            result = &mut send => match result {
                Ok(response) => break response,
                Err(e) => return ErrorInfo::new(classify(&e), e.to_string()),
            },
            _ = ticker.tick() => {
                if !report(&request, progress) {
                    return aborted();
                }
            }
        }
    };

    progress.uploaded = upload_total;
    progress.download_total = response.content_length();
    record_head(&response, outcome);

    loop {
        tokio::select! {
            chunk = response.chunk() => match chunk {
                Ok(Some(bytes)) => {
                    progress.downloaded += bytes.len() as u64;
                    if !report(&request, progress) {
                        return aborted();
                    }
                    match sink.as_mut() {
                        Some(sink) => {
                            if !sink.accept(&bytes) {
                                return ErrorInfo::new(ErrorCode::WriteError, "download sink refused data");
                            }
                            lock_outcome(outcome).downloaded += bytes.len() as u64;
                        }
                        None => lock_outcome(outcome).body.extend_from_slice(&bytes),
                    }
                }
                Ok(None) => break,
                Err(e) => return ErrorInfo::new(classify(&e), e.to_string()),
            },
            _ = ticker.tick() => {
                if !report(&request, progress) {
                    return aborted();
                }
            }
        }
    }

    if let Some(sink) = sink.as_mut()
        && !sink.finish()
    {
        return ErrorInfo::new(ErrorCode::WriteError, "download sink failed to flush");
    }
    ErrorInfo::ok()
}

fn build(
    client: &reqwest::Client,
    request: &Request,
    method: Method,
    timeout: Option<Duration>,
) -> reqwest::RequestBuilder {
    let mut builder = client.request(http_method(method), request.url.as_str());
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = match &request.auth {
        Some(Auth::Basic { user, password }) => builder.basic_auth(user, Some(password)),
        Some(Auth::Bearer(token)) => builder.bearer_auth(token),
        None => builder,
    };
    if let Some(body) = &request.body
        && matches!(method, Method::Post | Method::Put | Method::Patch)
    {
        builder = builder.body(body.clone());
    }
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
}

fn http_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get | Method::Download => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
        Method::Patch => reqwest::Method::PATCH,
        Method::Head => reqwest::Method::HEAD,
        Method::Options => reqwest::Method::OPTIONS,
    }
}

fn record_head(response: &reqwest::Response, outcome: &Mutex<Outcome>) {
    let mut outcome = lock_outcome(outcome);
    outcome.status = response.status().as_u16();
    for (name, value) in response.headers() {
        let Ok(value) = value.to_str() else { continue };
        outcome
            .headers
            .entry(name.as_str().to_string())
            .and_modify(|v| {
                v.push_str(", ");
                v.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
}

/// Whether the transfer may go on.
fn report(request: &Request, progress: Progress) -> bool {
    request
        .progress
        .as_ref()
        .is_none_or(|callback| callback(progress))
}

fn aborted() -> ErrorInfo {
    ErrorInfo::new(ErrorCode::AbortedByCallback, "transfer aborted")
}

fn classify(err: &reqwest::Error) -> ErrorCode {
    if err.is_timeout() {
        ErrorCode::OperationTimedOut
    } else if err.is_builder() {
        ErrorCode::InvalidUrlFormat
    } else if err.is_connect() {
        if is_dns_failure(err) {
            ErrorCode::CouldNotResolveHost
        } else {
            ErrorCode::CouldNotConnect
        }
    } else if err.is_body() || err.is_decode() || err.is_request() {
        ErrorCode::RecvError
    } else {
        ErrorCode::Unknown
    }
}

fn is_dns_failure(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if cause.to_string().contains("dns error") {
            return true;
        }
        source = cause.source();
    }
    false
}
