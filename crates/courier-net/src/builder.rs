//! Transport request construction.

use bytes::Bytes;
use http::HeaderValue;
use http::header::CONTENT_TYPE;
use url::Url;

use courier_core::logging::targets;

use crate::codec::{CodecError, CodecLookup};
use crate::error::{NetworkError, Result};
use crate::request::{ContentType, RequestBody, RequestDescriptor};
use crate::task::TaskId;
use crate::transport::TransportRequest;

/// Combine a resolved URL and a descriptor into a transport request.
///
/// The multipart boundary header is set first, then the body is encoded and
/// `Content-Type` derived from the request content type. Descriptor headers
/// are applied last and override anything computed here.
pub fn build_transport_request(
    task: TaskId,
    url: Url,
    descriptor: &RequestDescriptor,
    codecs: &CodecLookup<'_>,
) -> Result<TransportRequest> {
    let mut headers = http::HeaderMap::new();

    if let Some(RequestBody::Multipart(form)) = descriptor.body()
        && let Some(value) = header_value(&form.content_type_header())
    {
        headers.insert(CONTENT_TYPE, value);
    }

    let body = descriptor
        .body()
        .map(|body| encode_body(body, descriptor.request_content_type(), codecs))
        .transpose()?;

    if body.is_some()
        && !headers.contains_key(CONTENT_TYPE)
        && let Some(value) = descriptor
            .request_content_type()
            .mime()
            .and_then(header_value)
    {
        headers.insert(CONTENT_TYPE, value);
    }

    for name in descriptor.headers().keys() {
        headers.remove(name);
        for value in descriptor.headers().get_all(name) {
            headers.append(name.clone(), value.clone());
        }
    }

    tracing::trace!(
        target: targets::ENGINE,
        %task,
        method = %descriptor.method(),
        %url,
        body_len = body.as_ref().map_or(0, Bytes::len),
        "transport request built"
    );

    Ok(TransportRequest {
        task,
        method: descriptor.method().clone(),
        url,
        headers,
        body,
    })
}

fn header_value(value: &str) -> Option<HeaderValue> {
    match HeaderValue::from_str(value) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(target: targets::ENGINE, value, "content type is not a valid header value, skipped");
            None
        }
    }
}

/// Encode a body with the codec for `content_type`, override first.
pub fn encode_body(
    body: &RequestBody,
    content_type: &ContentType,
    codecs: &CodecLookup<'_>,
) -> Result<Bytes> {
    match body {
        RequestBody::Raw(bytes) => Ok(bytes.clone()),
        RequestBody::Multipart(form) => Ok(form.encode()),
        RequestBody::Encodable(value) => {
            let encoder = codecs.encoder(content_type).ok_or_else(|| {
                NetworkError::Serialization(CodecError::NoEncoder(content_type.to_string()))
            })?;
            encoder
                .encode(value.as_ref())
                .map_err(NetworkError::Serialization)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecRegistry, Encoder};
    use crate::request::{Encodable, MultipartForm};
    use http::Method;
    use http::header::{ACCEPT, HeaderName};
    use serde_json::json;

    fn url() -> Url {
        Url::parse("https://api.example.com/items").unwrap()
    }

    fn build(descriptor: &RequestDescriptor, registry: &CodecRegistry) -> Result<TransportRequest> {
        build_transport_request(
            TaskId::next(),
            url(),
            descriptor,
            &CodecLookup::new(descriptor.codecs().map(|c| c.as_ref()), registry),
        )
    }

    #[test]
    fn test_json_body_and_content_type() {
        let descriptor = RequestDescriptor::post("/items")
            .json(json!({"name": "Widget"}))
            .build();
        let request = build(&descriptor, &CodecRegistry::standard()).unwrap();

        assert_eq!(request.method, Method::POST);
        assert_eq!(request.url, url());
        assert_eq!(request.headers[CONTENT_TYPE], "application/json");
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(request.body.as_ref().unwrap()).unwrap(),
            json!({"name": "Widget"})
        );
    }

    #[test]
    fn test_no_body_no_content_type() {
        let descriptor = RequestDescriptor::get("/items").build();
        let request = build(&descriptor, &CodecRegistry::standard()).unwrap();
        assert!(request.body.is_none());
        assert!(!request.headers.contains_key(CONTENT_TYPE));
    }

    #[test]
    fn test_missing_encoder_is_serialization_error() {
        let descriptor = RequestDescriptor::post("/items")
            .body(json!({"a": 1}))
            .request_content_type(ContentType::Other("application/cbor".into()))
            .build();
        let err = build(&descriptor, &CodecRegistry::standard()).unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Serialization(CodecError::NoEncoder(mime)) if mime == "application/cbor"
        ));
    }

    #[test]
    fn test_encoder_failure_is_serialization_error() {
        let descriptor = RequestDescriptor::post("/login").form(json!([1, 2])).build();
        let err = build(&descriptor, &CodecRegistry::standard()).unwrap_err();
        assert!(matches!(err, NetworkError::Serialization(CodecError::Form(_))));
    }

    #[test]
    fn test_raw_body_unchanged() {
        let descriptor = RequestDescriptor::put("/blob")
            .raw(vec![0u8, 159, 146, 150], ContentType::Binary)
            .build();
        let request = build(&descriptor, &CodecRegistry::new()).unwrap();
        assert_eq!(request.body.as_deref(), Some(&[0u8, 159, 146, 150][..]));
        assert_eq!(request.headers[CONTENT_TYPE], "application/octet-stream");
    }

    #[test]
    fn test_multipart_boundary_header() {
        let form = MultipartForm::new().text("a", "b");
        let expected = form.content_type_header();
        let descriptor = RequestDescriptor::post("/upload").multipart(form).build();
        let request = build(&descriptor, &CodecRegistry::new()).unwrap();

        assert_eq!(request.headers[CONTENT_TYPE], expected.as_str());
        assert_eq!(request.headers.get_all(CONTENT_TYPE).iter().count(), 1);
        assert!(request.body.unwrap().starts_with(b"--courier-"));
    }

    #[test]
    fn test_descriptor_headers_override_computed() {
        let descriptor = RequestDescriptor::post("/items")
            .json(json!({}))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/vnd.api+json"))
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .header(
                HeaderName::from_static("x-request-id"),
                HeaderValue::from_static("42"),
            )
            .build();
        let request = build(&descriptor, &CodecRegistry::standard()).unwrap();

        assert_eq!(request.headers[CONTENT_TYPE], "application/vnd.api+json");
        assert_eq!(request.headers[ACCEPT], "application/json");
        assert_eq!(request.headers["x-request-id"], "42");
    }

    struct Shouting;

    impl Encoder for Shouting {
        fn encode(&self, body: &dyn Encodable) -> std::result::Result<Bytes, CodecError> {
            let text = body.to_value()?.to_string().to_uppercase();
            Ok(Bytes::from(text))
        }
    }

    #[test]
    fn test_override_encoder_takes_precedence() {
        let local = CodecRegistry::new();
        local.register_encoder(ContentType::Json, Shouting);

        let descriptor = RequestDescriptor::post("/items")
            .json(json!("quiet"))
            .codecs(std::sync::Arc::new(local))
            .build();
        let request = build(&descriptor, &CodecRegistry::standard()).unwrap();
        assert_eq!(request.body.as_deref(), Some(&b"\"QUIET\""[..]));
    }
}
