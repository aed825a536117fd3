//! Codecs for request and response bodies.
//!
//! Encoders turn an [`Encodable`] body into bytes for one content type.
//! Decoders turn response bytes into a neutral [`serde_json::Value`] tree,
//! which the response processor then converts into the caller's type with
//! serde. A [`CodecRegistry`] maps content types to codecs, and a
//! [`CodecLookup`] consults a per-request registry before the engine default.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use thiserror::Error;

use courier_core::logging::targets;

use crate::request::{ContentType, Encodable};

/// Errors raised while encoding or decoding a body.
#[derive(Error, Debug)]
pub enum CodecError {
    /// JSON encoding or decoding failed, or the decoded value did not match
    /// the requested type.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),
    /// The value cannot be represented as form data.
    #[error("form codec error: {0}")]
    Form(String),
    /// The value cannot be represented as text, or the body is not UTF-8.
    #[error("text codec error: {0}")]
    Text(String),
    /// No encoder is registered for the request content type.
    #[error("no encoder registered for {0}")]
    NoEncoder(String),
}

/// Encodes request bodies for one content type.
pub trait Encoder: Send + Sync {
    /// Encode a body.
    fn encode(&self, body: &dyn Encodable) -> Result<Bytes, CodecError>;
}

/// Decodes response bodies for one content type.
pub trait Decoder: Send + Sync {
    /// Decode a body into a neutral value tree.
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Encoder for JsonCodec {
    fn encode(&self, body: &dyn Encodable) -> Result<Bytes, CodecError> {
        let value = body.to_value()?;
        Ok(Bytes::from(serde_json::to_vec(&value)?))
    }
}

impl Decoder for JsonCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// `application/x-www-form-urlencoded` codec.
///
/// Encodes flat objects whose values are scalars, or sequences of
/// `[key, value]` pairs such as `[("user", "ada")]`, which keep their order
/// and may repeat a key. Decoding yields an object of strings; a repeated
/// key keeps its last value.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormCodec;

impl Encoder for FormCodec {
    fn encode(&self, body: &dyn Encodable) -> Result<Bytes, CodecError> {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        match body.to_value()? {
            Value::Object(fields) => {
                for (key, value) in &fields {
                    append_field(&mut serializer, key, value)?;
                }
            }
            Value::Array(pairs) => {
                for pair in &pairs {
                    let (key, value) = match pair.as_array().map(Vec::as_slice) {
                        Some([Value::String(key), value]) => (key.clone(), value),
                        Some([key @ (Value::Bool(_) | Value::Number(_)), value]) => {
                            (key.to_string(), value)
                        }
                        _ => {
                            return Err(CodecError::Form(format!(
                                "expected a [key, value] pair, found {pair}"
                            )));
                        }
                    };
                    append_field(&mut serializer, &key, value)?;
                }
            }
            _ => {
                return Err(CodecError::Form(
                    "form bodies must be objects or key/value pairs".into(),
                ));
            }
        }
        Ok(Bytes::from(serializer.finish()))
    }
}

fn append_field(
    serializer: &mut url::form_urlencoded::Serializer<'_, String>,
    key: &str,
    value: &Value,
) -> Result<(), CodecError> {
    match value {
        Value::Null => {}
        Value::String(s) => {
            serializer.append_pair(key, s);
        }
        Value::Bool(_) | Value::Number(_) => {
            serializer.append_pair(key, &value.to_string());
        }
        Value::Array(_) | Value::Object(_) => {
            return Err(CodecError::Form(format!(
                "field '{key}' is not a scalar value"
            )));
        }
    }
    Ok(())
}

impl Decoder for FormCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        let fields: Map<String, Value> = url::form_urlencoded::parse(bytes)
            .map(|(key, value)| (key.into_owned(), Value::String(value.into_owned())))
            .collect();
        Ok(Value::Object(fields))
    }
}

/// Plain text codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl Encoder for TextCodec {
    fn encode(&self, body: &dyn Encodable) -> Result<Bytes, CodecError> {
        match body.to_value()? {
            Value::String(s) => Ok(Bytes::from(s)),
            value @ (Value::Bool(_) | Value::Number(_)) => Ok(Bytes::from(value.to_string())),
            _ => Err(CodecError::Text("text bodies must be scalar values".into())),
        }
    }
}

impl Decoder for TextCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        std::str::from_utf8(bytes)
            .map(|text| Value::String(text.to_string()))
            .map_err(|e| CodecError::Text(e.to_string()))
    }
}

/// A registry of encoders and decoders keyed by content type.
///
/// Lookups take a read lock, so many requests can resolve codecs
/// concurrently; registration takes the write lock and may happen at any
/// time.
pub struct CodecRegistry {
    encoders: RwLock<HashMap<ContentType, Arc<dyn Encoder>>>,
    decoders: RwLock<HashMap<ContentType, Arc<dyn Decoder>>>,
}

impl CodecRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            encoders: RwLock::new(HashMap::new()),
            decoders: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry with JSON, form and text codecs registered.
    pub fn standard() -> Self {
        let registry = Self::new();
        registry.register_codec(ContentType::Json, JsonCodec);
        registry.register_codec(ContentType::FormUrlEncoded, FormCodec);
        registry.register_codec(ContentType::Text, TextCodec);
        registry
    }

    /// Register an encoder, replacing any previous one for the content type.
    pub fn register_encoder(&self, content_type: ContentType, encoder: impl Encoder + 'static) {
        tracing::debug!(target: targets::CODEC, content_type = %content_type, "encoder registered");
        self.encoders.write().insert(content_type, Arc::new(encoder));
    }

    /// Register a decoder, replacing any previous one for the content type.
    pub fn register_decoder(&self, content_type: ContentType, decoder: impl Decoder + 'static) {
        tracing::debug!(target: targets::CODEC, content_type = %content_type, "decoder registered");
        self.decoders.write().insert(content_type, Arc::new(decoder));
    }

    /// Register one value as both encoder and decoder.
    pub fn register_codec<C>(&self, content_type: ContentType, codec: C)
    where
        C: Encoder + Decoder + 'static,
    {
        let codec = Arc::new(codec);
        self.encoders
            .write()
            .insert(content_type.clone(), codec.clone());
        self.decoders.write().insert(content_type.clone(), codec);
        tracing::debug!(target: targets::CODEC, content_type = %content_type, "codec registered");
    }

    /// Remove the encoder for a content type.
    pub fn remove_encoder(&self, content_type: &ContentType) -> bool {
        self.encoders.write().remove(content_type).is_some()
    }

    /// Remove the decoder for a content type.
    pub fn remove_decoder(&self, content_type: &ContentType) -> bool {
        self.decoders.write().remove(content_type).is_some()
    }

    /// The encoder for a content type, if registered.
    pub fn encoder(&self, content_type: &ContentType) -> Option<Arc<dyn Encoder>> {
        self.encoders.read().get(content_type).cloned()
    }

    /// The decoder for a content type, if registered.
    pub fn decoder(&self, content_type: &ContentType) -> Option<Arc<dyn Decoder>> {
        self.decoders.read().get(content_type).cloned()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut encoders: Vec<String> = self.encoders.read().keys().map(ToString::to_string).collect();
        let mut decoders: Vec<String> = self.decoders.read().keys().map(ToString::to_string).collect();
        encoders.sort();
        decoders.sort();
        f.debug_struct("CodecRegistry")
            .field("encoders", &encoders)
            .field("decoders", &decoders)
            .finish()
    }
}

/// Two-level codec lookup: a per-request override, then the engine default.
#[derive(Debug, Clone, Copy)]
pub struct CodecLookup<'a> {
    local: Option<&'a CodecRegistry>,
    default: &'a CodecRegistry,
}

impl<'a> CodecLookup<'a> {
    /// Create a lookup over an optional override and the default registry.
    pub fn new(local: Option<&'a CodecRegistry>, default: &'a CodecRegistry) -> Self {
        Self { local, default }
    }

    /// The encoder for a content type, override first.
    pub fn encoder(&self, content_type: &ContentType) -> Option<Arc<dyn Encoder>> {
        self.local
            .and_then(|registry| registry.encoder(content_type))
            .or_else(|| self.default.encoder(content_type))
    }

    /// The decoder for a content type, override first.
    pub fn decoder(&self, content_type: &ContentType) -> Option<Arc<dyn Decoder>> {
        self.local
            .and_then(|registry| registry.decoder(content_type))
            .or_else(|| self.default.decoder(content_type))
    }
}

static_assertions::assert_impl_all!(CodecRegistry: Send, Sync);
