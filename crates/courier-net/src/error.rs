//! Error types for the request engine.

use bytes::Bytes;
use thiserror::Error;

use crate::codec::CodecError;
use crate::transport::TransportError;

/// Errors delivered for a submitted request.
///
/// Build-time failures (`NotConfigured`, `UrlBuild`, `Serialization`) are
/// detected before any I/O. Transport failures are classified once into
/// `InvalidSsl`, `NoInternet`, `Cancelled` or the `Transport` passthrough.
/// The remaining variants come from response processing.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// A request was submitted before the engine was configured.
    #[error("network manager is not configured")]
    NotConfigured,
    /// The descriptor could not be resolved into an endpoint URL.
    #[error("cannot build endpoint URL: {0}")]
    UrlBuild(String),
    /// The request body could not be encoded.
    #[error("request body serialization failed: {0}")]
    Serialization(#[source] CodecError),
    /// The transport produced a response without status metadata.
    #[error("response carried no status metadata")]
    InvalidResponse,
    /// The server answered 401.
    #[error("request was not authenticated")]
    Unauthenticated,
    /// The server answered with a non-success status other than 401.
    #[error("HTTP {status}")]
    Http {
        /// The HTTP status code.
        status: u16,
        /// The raw response body, unmodified.
        body: Bytes,
    },
    /// A request declaring no response body was decoded into a non-empty type.
    #[error("request declares no response body but {type_name} was requested")]
    UnexpectedResponse {
        /// Name of the requested result type.
        type_name: &'static str,
    },
    /// No decoder is registered for the response content type.
    #[error("no decoder registered for {0}")]
    NoDecoder(String),
    /// The response body was absent or empty.
    #[error("response body is empty")]
    NoData,
    /// The response body could not be decoded into the requested type.
    #[error("response deserialization failed: {0}")]
    Deserialization(#[source] CodecError),
    /// The secure channel could not be established.
    #[error("secure connection failed: {0}")]
    InvalidSsl(#[source] TransportError),
    /// The host could not be reached.
    #[error("no internet connection: {0}")]
    NoInternet(#[source] TransportError),
    /// Any other transport failure, passed through unchanged.
    #[error(transparent)]
    Transport(TransportError),
    /// The request was cancelled before completing.
    #[error("request was cancelled")]
    Cancelled,
    /// The engine or transport configuration is invalid.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// Local I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// The HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthenticated => Some(401),
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Check if this error represents a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error was detected before any transport call.
    pub fn is_build_failure(&self) -> bool {
        matches!(
            self,
            Self::NotConfigured | Self::UrlBuild(_) | Self::Serialization(_)
        )
    }

    /// Check if this error indicates missing connectivity.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::NoInternet(_))
    }
}

/// A specialized Result type for network operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

static_assertions::assert_impl_all!(NetworkError: Send, Sync);
