//! Request descriptors.
//!
//! A [`RequestDescriptor`] describes one API call before it is resolved into
//! a transport request: method, path template, path and query parameters,
//! headers, an optional body and the content types used to encode the body
//! and decode the response. Descriptors are built once and never mutated;
//! submitting one borrows it.
//!
//! # Example
//!
//! ```
//! use courier_net::{ContentType, RequestDescriptor};
//! use http::header::{ACCEPT, HeaderValue};
//!
//! #[derive(Debug, serde::Serialize)]
//! struct Rename {
//!     name: String,
//! }
//!
//! let descriptor = RequestDescriptor::patch("/widgets/{id}")
//!     .path_param("id", "42")
//!     .query("notify", "false")
//!     .header(ACCEPT, HeaderValue::from_static("application/json"))
//!     .json(Rename { name: "Gadget".into() })
//!     .build();
//!
//! assert_eq!(descriptor.path_param("id"), Some("42"));
//! assert_eq!(descriptor.request_content_type(), &ContentType::Json);
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use rand::Rng;
use serde::Serialize;

use crate::codec::CodecRegistry;

/// Content type of a request or response body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// No body.
    None,
    /// `application/json`.
    Json,
    /// `text/plain`.
    Text,
    /// `application/x-www-form-urlencoded`.
    FormUrlEncoded,
    /// `multipart/form-data`.
    Multipart,
    /// `application/octet-stream`.
    Binary,
    /// Any other MIME type.
    Other(String),
}

/// How a response body is turned into the caller's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodingPolicy {
    /// No body is expected.
    Empty,
    /// Raw bytes are returned when the target type accepts them.
    Binary,
    /// A registered decoder produces the value.
    Structured,
}

impl ContentType {
    /// The MIME string for this content type, `None` for [`ContentType::None`].
    pub fn mime(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Json => Some("application/json"),
            Self::Text => Some("text/plain; charset=utf-8"),
            Self::FormUrlEncoded => Some("application/x-www-form-urlencoded"),
            Self::Multipart => Some("multipart/form-data"),
            Self::Binary => Some("application/octet-stream"),
            Self::Other(mime) => Some(mime.as_str()),
        }
    }

    /// Map a MIME string to a content type, ignoring parameters and case.
    pub fn from_mime(mime: &str) -> Self {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "" => Self::None,
            "application/json" => Self::Json,
            "text/plain" => Self::Text,
            "application/x-www-form-urlencoded" => Self::FormUrlEncoded,
            "multipart/form-data" => Self::Multipart,
            "application/octet-stream" => Self::Binary,
            _ => Self::Other(essence),
        }
    }

    /// The decoding policy derived from this content type.
    pub fn decoding_policy(&self) -> DecodingPolicy {
        match self {
            Self::None => DecodingPolicy::Empty,
            Self::Binary => DecodingPolicy::Binary,
            _ => DecodingPolicy::Structured,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime().unwrap_or("none"))
    }
}

/// A value that can be encoded as a request body.
///
/// Implemented for every `Serialize` type. Encoders work on the neutral
/// value tree, so one body can be sent as JSON, form data or text depending
/// on the request content type.
pub trait Encodable: Send + Sync + fmt::Debug {
    /// Convert the value into a neutral value tree.
    fn to_value(&self) -> Result<serde_json::Value, serde_json::Error>;
}

impl<T> Encodable for T
where
    T: Serialize + Send + Sync + fmt::Debug,
{
    fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// The body of a request.
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// A structured value encoded by the codec for the request content type.
    Encodable(Arc<dyn Encodable>),
    /// Bytes sent unchanged.
    Raw(Bytes),
    /// A multipart form, which encodes itself.
    Multipart(MultipartForm),
}

#[derive(Debug, Clone)]
struct Part {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    data: Bytes,
}

/// A `multipart/form-data` body.
///
/// Each form gets a random boundary on creation.
#[derive(Debug, Clone)]
pub struct MultipartForm {
    boundary: String,
    parts: Vec<Part>,
}

impl MultipartForm {
    /// Create a new empty multipart form.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            boundary: format!("courier-{:016x}{:016x}", rng.r#gen::<u64>(), rng.r#gen::<u64>()),
            parts: Vec::new(),
        }
    }

    /// Add a text field.
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(Part {
            name: name.into(),
            filename: None,
            content_type: None,
            data: Bytes::from(value.into()),
        });
        self
    }

    /// Add a file field from bytes.
    pub fn file(
        mut self,
        name: impl Into<String>,
        data: impl Into<Bytes>,
        filename: impl Into<String>,
        content_type: Option<&str>,
    ) -> Self {
        self.parts.push(Part {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: content_type.map(str::to_string),
            data: data.into(),
        });
        self
    }

    /// The boundary separating the parts.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Number of parts in the form.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Check if the form has no parts.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// The `Content-Type` header value announcing this form's boundary.
    pub fn content_type_header(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Encode the form into its wire representation.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for part in &self.parts {
            buf.put_slice(b"--");
            buf.put_slice(self.boundary.as_bytes());
            buf.put_slice(b"\r\n");
            buf.put_slice(b"Content-Disposition: form-data; name=\"");
            buf.put_slice(escape_quoted(&part.name).as_bytes());
            buf.put_slice(b"\"");
            if let Some(filename) = &part.filename {
                buf.put_slice(b"; filename=\"");
                buf.put_slice(escape_quoted(filename).as_bytes());
                buf.put_slice(b"\"");
            }
            buf.put_slice(b"\r\n");
            if let Some(content_type) = &part.content_type {
                buf.put_slice(b"Content-Type: ");
                buf.put_slice(content_type.as_bytes());
                buf.put_slice(b"\r\n");
            }
            buf.put_slice(b"\r\n");
            buf.put_slice(&part.data);
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"--");
        buf.put_slice(self.boundary.as_bytes());
        buf.put_slice(b"--\r\n");
        buf.freeze()
    }
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

fn escape_quoted(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

/// An immutable description of one API call.
#[derive(Clone)]
pub struct RequestDescriptor {
    method: Method,
    path: String,
    path_params: Vec<(String, String)>,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<RequestBody>,
    request_content_type: ContentType,
    response_content_type: ContentType,
    codecs: Option<Arc<CodecRegistry>>,
}

impl RequestDescriptor {
    /// Start building a descriptor with the given method and path template.
    ///
    /// The path is either relative to the configured base URL (with
    /// `{name}` placeholders for path parameters) or an absolute
    /// `http`/`https` URL.
    pub fn builder(method: Method, path: impl Into<String>) -> RequestDescriptorBuilder {
        RequestDescriptorBuilder {
            descriptor: Self {
                method,
                path: path.into(),
                path_params: Vec::new(),
                query: Vec::new(),
                headers: HeaderMap::new(),
                body: None,
                request_content_type: ContentType::Json,
                response_content_type: ContentType::Json,
                codecs: None,
            },
        }
    }

    /// Start building a GET descriptor.
    pub fn get(path: impl Into<String>) -> RequestDescriptorBuilder {
        Self::builder(Method::GET, path)
    }

    /// Start building a POST descriptor.
    pub fn post(path: impl Into<String>) -> RequestDescriptorBuilder {
        Self::builder(Method::POST, path)
    }

    /// Start building a PUT descriptor.
    pub fn put(path: impl Into<String>) -> RequestDescriptorBuilder {
        Self::builder(Method::PUT, path)
    }

    /// Start building a PATCH descriptor.
    pub fn patch(path: impl Into<String>) -> RequestDescriptorBuilder {
        Self::builder(Method::PATCH, path)
    }

    /// Start building a DELETE descriptor.
    pub fn delete(path: impl Into<String>) -> RequestDescriptorBuilder {
        Self::builder(Method::DELETE, path)
    }

    /// The HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The path template or absolute URL.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path parameters in insertion order.
    pub fn path_params(&self) -> &[(String, String)] {
        &self.path_params
    }

    /// Look up a path parameter. The last value set for a name wins.
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Query pairs in insertion order.
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The request body, if any.
    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    /// Content type used to encode the body.
    pub fn request_content_type(&self) -> &ContentType {
        &self.request_content_type
    }

    /// Content type expected for the response.
    pub fn response_content_type(&self) -> &ContentType {
        &self.response_content_type
    }

    /// Per-request codec registry override, if any.
    pub fn codecs(&self) -> Option<&Arc<CodecRegistry>> {
        self.codecs.as_ref()
    }
}

impl fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("path_params", &self.path_params)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("request_content_type", &self.request_content_type)
            .field("response_content_type", &self.response_content_type)
            .field("codec_override", &self.codecs.is_some())
            .finish()
    }
}

/// Builder for [`RequestDescriptor`].
#[derive(Debug, Clone)]
pub struct RequestDescriptorBuilder {
    descriptor: RequestDescriptor,
}

impl RequestDescriptorBuilder {
    /// Bind a `{name}` placeholder in the path template.
    pub fn path_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.descriptor
            .path_params
            .push((name.into(), value.to_string()));
        self
    }

    /// Append a query pair.
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.descriptor.query.push((key.into(), value.to_string()));
        self
    }

    /// Set a header, replacing previous values for the same name.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.descriptor.headers.insert(name, value);
        self
    }

    /// Add every header from a map.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.descriptor.headers.extend(headers);
        self
    }

    /// Set a structured body encoded with the current request content type.
    pub fn body<B: Encodable + 'static>(mut self, body: B) -> Self {
        self.descriptor.body = Some(RequestBody::Encodable(Arc::new(body)));
        self
    }

    /// Set a body encoded as JSON.
    pub fn json<B: Encodable + 'static>(self, body: B) -> Self {
        self.request_content_type(ContentType::Json).body(body)
    }

    /// Set a body encoded as `application/x-www-form-urlencoded`.
    pub fn form<B: Encodable + 'static>(self, body: B) -> Self {
        self.request_content_type(ContentType::FormUrlEncoded)
            .body(body)
    }

    /// Set a raw body sent unchanged with the given content type.
    pub fn raw(mut self, bytes: impl Into<Bytes>, content_type: ContentType) -> Self {
        self.descriptor.body = Some(RequestBody::Raw(bytes.into()));
        self.descriptor.request_content_type = content_type;
        self
    }

    /// Set a multipart form body.
    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.descriptor.body = Some(RequestBody::Multipart(form));
        self.descriptor.request_content_type = ContentType::Multipart;
        self
    }

    /// Set the content type used to encode the body.
    pub fn request_content_type(mut self, content_type: ContentType) -> Self {
        self.descriptor.request_content_type = content_type;
        self
    }

    /// Set the content type expected for the response.
    pub fn response_content_type(mut self, content_type: ContentType) -> Self {
        self.descriptor.response_content_type = content_type;
        self
    }

    /// Use a codec registry that takes precedence over the engine default.
    pub fn codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.descriptor.codecs = Some(codecs);
        self
    }

    /// Finish building.
    pub fn build(self) -> RequestDescriptor {
        self.descriptor
    }
}

static_assertions::assert_impl_all!(RequestDescriptor: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecLookup;

    #[test]
    fn test_content_type_mime_round_trip() {
        for ct in [
            ContentType::Json,
            ContentType::Text,
            ContentType::FormUrlEncoded,
            ContentType::Multipart,
            ContentType::Binary,
        ] {
            assert_eq!(ContentType::from_mime(ct.mime().unwrap()), ct);
        }
        assert_eq!(ContentType::None.mime(), None);
        assert_eq!(
            ContentType::from_mime("Application/Problem+JSON; charset=utf-8"),
            ContentType::Other("application/problem+json".into())
        );
    }

    #[test]
    fn test_decoding_policy() {
        assert_eq!(ContentType::None.decoding_policy(), DecodingPolicy::Empty);
        assert_eq!(ContentType::Binary.decoding_policy(), DecodingPolicy::Binary);
        assert_eq!(ContentType::Json.decoding_policy(), DecodingPolicy::Structured);
        assert_eq!(
            ContentType::Other("application/cbor".into()).decoding_policy(),
            DecodingPolicy::Structured
        );
    }

    #[test]
    fn test_builder_defaults() {
        let descriptor = RequestDescriptor::get("/status").build();
        assert_eq!(descriptor.method(), &Method::GET);
        assert_eq!(descriptor.path(), "/status");
        assert!(descriptor.body().is_none());
        assert_eq!(descriptor.request_content_type(), &ContentType::Json);
        assert_eq!(descriptor.response_content_type(), &ContentType::Json);
        assert!(descriptor.codecs().is_none());
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let descriptor = RequestDescriptor::get("/")
            .header(
                HeaderName::from_static("x-trace"),
                HeaderValue::from_static("abc"),
            )
            .build();
        assert_eq!(descriptor.headers().get("X-Trace").unwrap(), "abc");
    }

    #[test]
    fn test_path_param_last_wins() {
        let descriptor = RequestDescriptor::get("/items/{id}")
            .path_param("id", 1)
            .path_param("id", 2)
            .build();
        assert_eq!(descriptor.path_param("id"), Some("2"));
        assert_eq!(descriptor.path_param("other"), None);
    }

    #[test]
    fn test_body_setters_adjust_content_type() {
        let form = RequestDescriptor::post("/login")
            .form([("user", "ada")])
            .build();
        assert_eq!(form.request_content_type(), &ContentType::FormUrlEncoded);
        let registry = CodecRegistry::standard();
        let encoded = crate::builder::encode_body(
            form.body().unwrap(),
            form.request_content_type(),
            &CodecLookup::new(None, &registry),
        )
        .unwrap();
        assert_eq!(&encoded[..], b"user=ada");

        let raw = RequestDescriptor::put("/blob")
            .raw(vec![1u8, 2, 3], ContentType::Binary)
            .build();
        assert!(matches!(raw.body(), Some(RequestBody::Raw(bytes)) if bytes.len() == 3));
        assert_eq!(raw.request_content_type(), &ContentType::Binary);
    }

    #[test]
    fn test_multipart_encoding() {
        let form = MultipartForm::new()
            .text("title", "Report")
            .file("doc", &b"hello"[..], "a\"b.txt", Some("text/plain"));
        let boundary = form.boundary().to_string();
        let encoded = String::from_utf8(form.encode().to_vec()).unwrap();

        assert!(encoded.starts_with(&format!("--{boundary}\r\n")));
        assert!(encoded.contains("Content-Disposition: form-data; name=\"title\"\r\n\r\nReport\r\n"));
        assert!(encoded.contains("name=\"doc\"; filename=\"a%22b.txt\"\r\nContent-Type: text/plain\r\n\r\nhello\r\n"));
        assert!(encoded.ends_with(&format!("--{boundary}--\r\n")));
        assert_eq!(
            form.content_type_header(),
            format!("multipart/form-data; boundary={boundary}")
        );
    }

    #[test]
    fn test_multipart_boundaries_differ() {
        assert_ne!(MultipartForm::new().boundary(), MultipartForm::new().boundary());
    }
}
