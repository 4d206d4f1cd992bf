//! Request description shared by sessions and transports.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// HTTP method tag. `Download` is a GET whose body goes to a [`DownloadSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Download,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get | Method::Download => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }

    pub fn is_download(&self) -> bool {
        matches!(self, Method::Download)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Download => write!(f, "DOWNLOAD"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

impl std::str::FromStr for Method {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "PATCH" => Ok(Method::Patch),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            "DOWNLOAD" => Ok(Method::Download),
            _ => Err(crate::Error::invalid(format!("unknown method: {s}"))),
        }
    }
}

/// Credentials attached as an `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    Basic { user: String, password: String },
    Bearer(String),
}

/// Transfer progress snapshot handed to a [`ProgressCallback`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub download_total: Option<u64>,
    pub downloaded: u64,
    pub upload_total: u64,
    pub uploaded: u64,
}

/// Called during a transfer; returning `false` aborts it.
pub type ProgressCallback = Arc<dyn Fn(Progress) -> bool + Send + Sync>;

/// Destination for the body of a `Download`.
pub enum DownloadSink {
    /// Receives each chunk; returning `false` aborts with a write error.
    Callback(Box<dyn FnMut(&[u8]) -> bool + Send>),
    Writer(Box<dyn Write + Send>),
}

impl DownloadSink {
    pub fn callback(f: impl FnMut(&[u8]) -> bool + Send + 'static) -> Self {
        Self::Callback(Box::new(f))
    }

    pub fn writer(w: impl Write + Send + 'static) -> Self {
        Self::Writer(Box::new(w))
    }

    /// Deliver one chunk. `false` means the sink refused it.
    pub(crate) fn accept(&mut self, chunk: &[u8]) -> bool {
        match self {
            Self::Callback(f) => f(chunk),
            Self::Writer(w) => w.write_all(chunk).is_ok(),
        }
    }

    pub(crate) fn finish(&mut self) -> bool {
        match self {
            Self::Callback(_) => true,
            Self::Writer(w) => w.flush().is_ok(),
        }
    }
}

impl std::fmt::Debug for DownloadSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("DownloadSink::Callback"),
            Self::Writer(_) => f.write_str("DownloadSink::Writer"),
        }
    }
}

/// Everything a transport needs besides the method.
#[derive(Clone, Default)]
pub struct Request {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub auth: Option<Auth>,
    pub timeout: Option<Duration>,
    pub progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("body_len", &self.body.as_ref().map(Vec::len))
            .field("auth", &self.auth.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl Request {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Appends; an existing header of the same name is kept.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// JSON body plus a matching `Content-Type`.
    pub fn with_json<T: serde::Serialize>(self, value: &T) -> serde_json::Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .with_header("Content-Type", "application/json")
            .with_body(body))
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_progress(mut self, f: impl Fn(Progress) -> bool + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(f));
        self
    }

    /// Case-insensitive lookup of the first header named `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parsing_is_case_insensitive() {
        assert_eq!("get".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("Download".parse::<Method>().unwrap(), Method::Download);
        assert!("BREW".parse::<Method>().is_err());
    }

    #[test]
    fn download_goes_over_get() {
        assert_eq!(Method::Download.as_str(), "GET");
        assert_eq!(Method::Download.to_string(), "DOWNLOAD");
        assert!(Method::Download.is_download());
        assert!(!Method::Get.is_download());
    }

    #[test]
    fn request_builder() {
        let req = Request::new("http://localhost/items")
            .with_header("X-Trace", "abc")
            .with_json(&serde_json::json!({"id": 1}))
            .unwrap()
            .with_timeout(Duration::from_secs(2));

        assert_eq!(req.header("x-trace"), Some("abc"));
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert_eq!(req.body.as_deref(), Some(br#"{"id":1}"#.as_slice()));
        assert_eq!(req.timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn debug_redacts_credentials() {
        let req = Request::new("http://localhost").with_auth(Auth::Bearer("secret".into()));
        let rendered = format!("{req:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn writer_sink_collects_chunks() {
        let buf = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_buf = std::sync::Arc::clone(&buf);
        let mut sink = DownloadSink::callback(move |chunk| {
            sink_buf.lock().unwrap().extend_from_slice(chunk);
            true
        });
        assert!(sink.accept(b"abc"));
        assert!(sink.accept(b"def"));
        assert!(sink.finish());
        assert_eq!(buf.lock().unwrap().as_slice(), b"abcdef");
    }
}
