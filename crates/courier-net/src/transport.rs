//! The transport contract.
//!
//! A [`Transport`] performs the actual network I/O. The engine hands it a
//! fully built [`TransportRequest`] and a completion callback; the transport
//! invokes the callback exactly once, on whatever thread it likes, with
//! either a [`TransportResponse`] or a [`TransportError`]. Background
//! transfers report only through session events sent to the multicaster
//! given to [`Transport::configure`].
//!
//! [`ReqwestTransport`] is the production implementation.

mod client;
pub mod runtime;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method};
use url::Url;

use crate::config::ConnectionSettings;
use crate::delegate::DelegateMulticaster;
use crate::error::Result;
use crate::task::{Cancelable, TaskId};

pub use client::ReqwestTransport;

/// A request ready to be sent, produced fresh for every submission.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// The task this request belongs to.
    pub task: TaskId,
    /// The HTTP method.
    pub method: Method,
    /// The resolved URL, including query.
    pub url: Url,
    /// Headers to send.
    pub headers: HeaderMap,
    /// Encoded body bytes.
    pub body: Option<Bytes>,
}

/// Status metadata for a response.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    /// The HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// The final URL after redirects, if known.
    pub url: Option<Url>,
}

/// What the transport received.
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    /// Status metadata. `None` if the response was not HTTP-shaped.
    pub meta: Option<ResponseMeta>,
    /// The response body.
    pub body: Option<Bytes>,
}

impl TransportResponse {
    /// A response with a status and body.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            meta: Some(ResponseMeta {
                status,
                headers: HeaderMap::new(),
                url: None,
            }),
            body: Some(body.into()),
        }
    }

    /// A response with a status and no body.
    pub fn status_only(status: u16) -> Self {
        Self {
            body: None,
            ..Self::new(status, Bytes::new())
        }
    }

    /// A response without status metadata.
    pub fn without_status(body: Option<Bytes>) -> Self {
        Self { meta: None, body }
    }

    /// Attach response headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        if let Some(meta) = self.meta.as_mut() {
            meta.headers = headers;
        }
        self
    }

    /// The status code, if present.
    pub fn status(&self) -> Option<u16> {
        self.meta.as_ref().map(|meta| meta.status)
    }
}

/// Broad category of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The secure channel could not be established.
    Tls,
    /// Name resolution failed.
    Dns,
    /// The peer refused the connection.
    ConnectionRefused,
    /// An established connection dropped.
    ConnectionLost,
    /// The network is down or unreachable.
    Offline,
    /// The request timed out.
    TimedOut,
    /// The transfer was cancelled.
    Cancelled,
    /// Anything else.
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tls => "TLS failure",
            Self::Dns => "DNS failure",
            Self::ConnectionRefused => "connection refused",
            Self::ConnectionLost => "connection lost",
            Self::Offline => "network unreachable",
            Self::TimedOut => "timed out",
            Self::Cancelled => "cancelled",
            Self::Other => "transport error",
        })
    }
}

/// A failure reported by a transport.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    /// Create an error without an underlying cause.
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Create an error wrapping an underlying cause.
    pub fn with_source(
        kind: TransportErrorKind,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// A cancellation error.
    pub fn cancelled() -> Self {
        Self::new(TransportErrorKind::Cancelled, "transfer cancelled")
    }

    /// The failure category.
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Callback receiving the outcome of a standard submission.
pub type TransportCompletion =
    Box<dyn FnOnce(std::result::Result<TransportResponse, TransportError>) + Send + 'static>;

/// Pluggable network I/O.
pub trait Transport: Send + Sync {
    /// Apply connection settings and remember where to send session events.
    ///
    /// Called by [`NetworkManager::configure`](crate::NetworkManager::configure)
    /// each time a configuration is installed.
    fn configure(
        &self,
        settings: &ConnectionSettings,
        events: Arc<DelegateMulticaster>,
    ) -> Result<()>;

    /// Start a standard request.
    ///
    /// `completion` must be invoked exactly once.
    fn submit(&self, request: TransportRequest, completion: TransportCompletion)
    -> Box<dyn Cancelable>;

    /// Start uploading the contents of `file`.
    ///
    /// The file is only guaranteed to exist for the duration of this call;
    /// the transport must take ownership of its contents before returning.
    fn submit_background_upload(
        &self,
        request: TransportRequest,
        file: &Path,
    ) -> Result<Box<dyn Cancelable>>;

    /// Start a download whose progress is reported through session events.
    fn submit_background_download(&self, request: TransportRequest) -> Result<Box<dyn Cancelable>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_transport_error_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = TransportError::with_source(TransportErrorKind::ConnectionLost, "read failed", io);

        assert_eq!(err.kind(), TransportErrorKind::ConnectionLost);
        assert_eq!(err.to_string(), "connection lost: read failed");
        assert_eq!(err.source().unwrap().to_string(), "reset by peer");
        assert!(TransportError::cancelled().source().is_none());
    }

    #[test]
    fn test_response_constructors() {
        let response = TransportResponse::new(200, "ok");
        assert_eq!(response.status(), Some(200));
        assert_eq!(response.body.as_deref(), Some(&b"ok"[..]));

        assert!(TransportResponse::status_only(204).body.is_none());
        assert_eq!(TransportResponse::without_status(None).status(), None);
    }
}
