//! Response processing and error classification.
//!
//! Both functions here are pure: they turn a transport outcome into the
//! caller's result without touching any shared state. The manager applies
//! them exactly once per request, on the transport's completion path, and
//! only delivery is dispatched.

use std::any::{Any, TypeId};

use bytes::Bytes;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use courier_core::logging::targets;

use crate::codec::{CodecError, CodecLookup};
use crate::error::{NetworkError, Result};
use crate::request::{ContentType, DecodingPolicy};
use crate::transport::{TransportError, TransportErrorKind, TransportResponse};

/// Result type for requests that expect no response body.
///
/// Use it with [`ContentType::None`] as the response content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct EmptyResponse;

/// Map a transport failure into the error taxonomy.
///
/// TLS failures become [`NetworkError::InvalidSsl`]; DNS, refused, lost and
/// offline failures become [`NetworkError::NoInternet`]; cancellation becomes
/// [`NetworkError::Cancelled`]. Everything else, timeouts included, passes
/// through as [`NetworkError::Transport`].
pub fn classify_transport_error(error: TransportError) -> NetworkError {
    let classified = match error.kind() {
        TransportErrorKind::Tls => NetworkError::InvalidSsl(error),
        TransportErrorKind::Dns
        | TransportErrorKind::ConnectionRefused
        | TransportErrorKind::ConnectionLost
        | TransportErrorKind::Offline => NetworkError::NoInternet(error),
        TransportErrorKind::Cancelled => NetworkError::Cancelled,
        TransportErrorKind::TimedOut | TransportErrorKind::Other => NetworkError::Transport(error),
    };
    tracing::debug!(target: targets::ENGINE, error = %classified, "transport error classified");
    classified
}

/// Turn a transport outcome into a typed result.
///
/// A transport error is classified and nothing is decoded. A response
/// without status metadata is [`NetworkError::InvalidResponse`]. 2xx
/// responses are decoded according to the response content type's
/// [`DecodingPolicy`]; 401 is [`NetworkError::Unauthenticated`]; any other
/// status is [`NetworkError::Http`] carrying the raw body.
pub fn process_response<T>(
    outcome: std::result::Result<TransportResponse, TransportError>,
    response_type: &ContentType,
    codecs: &CodecLookup<'_>,
) -> Result<T>
where
    T: DeserializeOwned + 'static,
{
    let response = outcome.map_err(classify_transport_error)?;
    let meta = response.meta.ok_or(NetworkError::InvalidResponse)?;

    match meta.status {
        200..=299 => decode(response.body, response_type, codecs),
        401 => Err(NetworkError::Unauthenticated),
        status => Err(NetworkError::Http {
            status,
            body: response.body.unwrap_or_default(),
        }),
    }
}

fn decode<T>(body: Option<Bytes>, response_type: &ContentType, codecs: &CodecLookup<'_>) -> Result<T>
where
    T: DeserializeOwned + 'static,
{
    match response_type.decoding_policy() {
        DecodingPolicy::Empty => cast(EmptyResponse).ok_or(NetworkError::UnexpectedResponse {
            type_name: std::any::type_name::<T>(),
        }),
        DecodingPolicy::Binary => match raw_bytes::<T>(body.as_ref()) {
            Some(value) => Ok(value),
            None => decode_structured(body, response_type, codecs),
        },
        DecodingPolicy::Structured => decode_structured(body, response_type, codecs),
    }
}

fn decode_structured<T>(
    body: Option<Bytes>,
    response_type: &ContentType,
    codecs: &CodecLookup<'_>,
) -> Result<T>
where
    T: DeserializeOwned,
{
    let decoder = codecs
        .decoder(response_type)
        .ok_or_else(|| NetworkError::NoDecoder(response_type.to_string()))?;
    let body = body.filter(|b| !b.is_empty()).ok_or(NetworkError::NoData)?;
    let value = decoder
        .decode(&body)
        .map_err(NetworkError::Deserialization)?;
    serde_json::from_value(value).map_err(|e| NetworkError::Deserialization(CodecError::Json(e)))
}

fn cast<T: 'static, U: 'static>(value: U) -> Option<T> {
    let boxed: Box<dyn Any> = Box::new(value);
    boxed.downcast::<T>().ok().map(|value| *value)
}

fn raw_bytes<T: 'static>(body: Option<&Bytes>) -> Option<T> {
    let body = body.cloned().unwrap_or_default();
    if TypeId::of::<T>() == TypeId::of::<Bytes>() {
        cast(body)
    } else if TypeId::of::<T>() == TypeId::of::<Vec<u8>>() {
        cast(body.to_vec())
    } else {
        None
    }
}
