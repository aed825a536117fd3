//! Request engine for Courier.
//!
//! This crate turns declarative request descriptions into network calls and
//! typed results:
//!
//! - **Descriptors**: Method, path template, parameters, headers, body and
//!   content types of one request ([`RequestDescriptor`])
//! - **Codecs**: Encoders and decoders keyed by content type, with
//!   per-request overrides ([`CodecRegistry`])
//! - **Transports**: Pluggable network I/O with a reqwest implementation
//!   ([`Transport`], [`ReqwestTransport`])
//! - **Results**: A fixed error taxonomy applied to every response
//!   ([`NetworkError`])
//! - **Tasks**: Cancelable handles with exactly-once delivery ([`TaskHandle`])
//! - **Session Events**: Redirects, auth challenges, metrics and transfer
//!   progress fanned out to weakly held observers ([`DelegateMulticaster`])
//!
//! Every result and progress callback is delivered on the dispatch context
//! of the installed [`EngineConfiguration`].
//!
//! # Example
//!
//! ```ignore
//! use courier_net::{EngineConfiguration, NetworkManager, RequestDescriptor, ReqwestTransport};
//! use std::sync::Arc;
//!
//! #[derive(serde::Deserialize)]
//! struct Widget {
//!     id: String,
//!     name: String,
//! }
//!
//! let manager = NetworkManager::new();
//! manager.configure(
//!     EngineConfiguration::builder(Arc::new(ReqwestTransport::new()))
//!         .base_url("https://api.example.com/v1/")
//!         .build()?,
//! )?;
//!
//! let descriptor = RequestDescriptor::get("/widgets/{id}")
//!     .path_param("id", "1")
//!     .build();
//!
//! let widget: Widget = manager.submit_stream(&descriptor).single().await?;
//! ```
//!
//! # Background Transfers
//!
//! ```ignore
//! let descriptor = RequestDescriptor::post("/uploads")
//!     .raw(payload, ContentType::Binary)
//!     .build();
//!
//! let handle = manager.submit_background_upload(&descriptor, |progress| {
//!     println!("{:?}% uploaded", progress.percent());
//! })?;
//! ```

pub mod builder;
pub mod codec;
pub mod config;
pub mod delegate;
mod error;
pub mod manager;
pub mod progress;
pub mod request;
pub mod resolver;
pub mod response;
pub mod task;
pub mod transport;

pub use builder::{build_transport_request, encode_body};
pub use codec::{
    CodecError, CodecLookup, CodecRegistry, Decoder, Encoder, FormCodec, JsonCodec, TextCodec,
};
pub use config::{ConnectionSettings, EngineConfiguration, EngineConfigurationBuilder};
pub use delegate::{DelegateMulticaster, SessionEvent, SessionObserver};
pub use error::{NetworkError, Result};
pub use manager::{NetworkManager, ResponseStream};
pub use progress::{ProgressHandler, ProgressTracker, TransferDirection, TransferProgress};
pub use request::{
    ContentType, DecodingPolicy, Encodable, MultipartForm, RequestBody, RequestDescriptor,
    RequestDescriptorBuilder,
};
pub use resolver::{EndpointResolver, TemplateResolver};
pub use response::{EmptyResponse, classify_transport_error, process_response};
pub use task::{Cancelable, TaskHandle, TaskId, TaskState};
pub use transport::{
    ReqwestTransport, ResponseMeta, Transport, TransportCompletion, TransportError,
    TransportErrorKind, TransportRequest, TransportResponse,
};
