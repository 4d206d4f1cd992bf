//! Response value produced by every request path.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Error, Result};

/// Transport-level outcome of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[default]
    Ok,
    /// Cancelled through a token or a progress callback.
    AbortedByCallback,
    OperationTimedOut,
    CouldNotResolveHost,
    CouldNotConnect,
    InvalidUrlFormat,
    RecvError,
    /// A download sink refused a chunk.
    WriteError,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ErrorCode::Ok
    }
}

/// Result of one HTTP transfer.
///
/// A failed transfer still yields a `Response`; check [`error`](Self::error).
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Response {
    pub status_code: u16,
    pub text: String,
    /// Header names are lowercased. Repeated headers are joined with `, `.
    pub headers: BTreeMap<String, String>,
    /// Effective URL of the request.
    pub url: String,
    /// Seconds spent in the transfer.
    pub elapsed: f64,
    pub error: ErrorInfo,
    /// Body bytes handed to a download sink.
    pub downloaded_bytes: u64,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_ok() && (200..300).contains(&self.status_code)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.text)
            .map_err(|e| Error::invalid(format!("response body is not valid JSON: {e}")))
    }
}
