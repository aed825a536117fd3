//! Transport backed by reqwest.

use std::error::Error;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::stream;
use http::StatusCode;
use http::header::{CONTENT_LENGTH, WWW_AUTHENTICATE};
use parking_lot::{Mutex, RwLock};
use reqwest::redirect::Policy;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use url::Url;

use courier_core::logging::targets;

use super::{
    ResponseMeta, Transport, TransportCompletion, TransportError, TransportErrorKind,
    TransportRequest, TransportResponse, runtime,
};
use crate::config::ConnectionSettings;
use crate::delegate::{DelegateMulticaster, SessionEvent};
use crate::error::{NetworkError, Result};
use crate::task::{Cancelable, TaskId};

/// Upload bodies are streamed in chunks of this size; one progress event is
/// emitted per chunk.
const UPLOAD_CHUNK_SIZE: usize = 256 * 1024;

struct Session {
    client: reqwest::Client,
    events: Arc<DelegateMulticaster>,
    download_dir: PathBuf,
}

/// A [`Transport`] performing HTTP with reqwest on a tokio runtime.
///
/// Work is spawned on the runtime passed to
/// [`with_runtime`](Self::with_runtime), otherwise on the runtime of the
/// submitting thread, otherwise on a shared runtime created on first use.
/// The client is rebuilt from the connection settings on every
/// [`configure`](Transport::configure).
///
/// Besides completing requests, the transport reports these session events:
/// `Redirect` when the final URL differs from the requested one,
/// `AuthChallenge` for a 401 carrying `WWW-Authenticate`, `Metrics` and
/// `TaskFinished` for every task, and upload or download progress for
/// background transfers.
pub struct ReqwestTransport {
    session: RwLock<Option<Arc<Session>>>,
    runtime: Option<Handle>,
}

impl ReqwestTransport {
    /// Create a transport that spawns on the caller's runtime.
    pub fn new() -> Self {
        Self {
            session: RwLock::new(None),
            runtime: None,
        }
    }

    /// Create a transport that spawns on the given runtime.
    pub fn with_runtime(handle: Handle) -> Self {
        Self {
            session: RwLock::new(None),
            runtime: Some(handle),
        }
    }

    /// Check if [`configure`](Transport::configure) has been called.
    pub fn is_configured(&self) -> bool {
        self.session.read().is_some()
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    fn runtime(&self) -> io::Result<Handle> {
        match &self.runtime {
            Some(handle) => Ok(handle.clone()),
            None => runtime::current_or_shared(),
        }
    }

    fn prepare(&self) -> Result<(Arc<Session>, Handle)> {
        let session = self
            .session()
            .ok_or_else(|| NetworkError::Configuration("transport is not configured".into()))?;
        Ok((session, self.runtime()?))
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("configured", &self.is_configured())
            .field("dedicated_runtime", &self.runtime.is_some())
            .finish()
    }
}

impl Transport for ReqwestTransport {
    fn configure(
        &self,
        settings: &ConnectionSettings,
        events: Arc<DelegateMulticaster>,
    ) -> Result<()> {
        let client = build_client(settings)?;
        let download_dir = settings
            .download_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        *self.session.write() = Some(Arc::new(Session {
            client,
            events,
            download_dir,
        }));
        tracing::debug!(target: targets::TRANSPORT, "reqwest transport configured");
        Ok(())
    }

    fn submit(
        &self,
        request: TransportRequest,
        completion: TransportCompletion,
    ) -> Box<dyn Cancelable> {
        let (cancel, cancelled) = CancelSignal::pair();
        let (session, runtime) = match self.prepare() {
            Ok(prepared) => prepared,
            Err(error) => {
                completion(Err(TransportError::with_source(
                    TransportErrorKind::Other,
                    "transport unavailable",
                    error,
                )));
                return Box::new(cancel);
            }
        };

        runtime.spawn(async move {
            let task = request.task;
            let started = Instant::now();
            let bytes_sent = request.body.as_ref().map_or(0, |body| body.len() as u64);

            let outcome = tokio::select! {
                outcome = session.execute(request) => outcome,
                Ok(()) = cancelled => Err(TransportError::cancelled()),
            };

            let bytes_received = outcome
                .as_ref()
                .ok()
                .and_then(|response| response.body.as_ref())
                .map_or(0, |body| body.len() as u64);
            session.events.emit(&SessionEvent::Metrics {
                task,
                elapsed: started.elapsed(),
                bytes_sent,
                bytes_received,
            });
            session.finish(task, outcome.as_ref().err());
            completion(outcome);
        });

        Box::new(cancel)
    }

    fn submit_background_upload(
        &self,
        request: TransportRequest,
        file: &Path,
    ) -> Result<Box<dyn Cancelable>> {
        let (session, runtime) = self.prepare()?;
        let contents = Bytes::from(std::fs::read(file)?);
        let (cancel, cancelled) = CancelSignal::pair();
        tracing::debug!(target: targets::TRANSPORT, task = %request.task, bytes = contents.len(), "background upload started");

        runtime.spawn(async move {
            let task = request.task;
            let started = Instant::now();
            let bytes_sent = contents.len() as u64;

            let outcome = tokio::select! {
                outcome = session.upload(request, contents) => outcome,
                Ok(()) = cancelled => Err(TransportError::cancelled()),
            };

            session.events.emit(&SessionEvent::Metrics {
                task,
                elapsed: started.elapsed(),
                bytes_sent,
                bytes_received: *outcome.as_ref().unwrap_or(&0),
            });
            session.finish(task, outcome.as_ref().err());
        });

        Ok(Box::new(cancel))
    }

    fn submit_background_download(&self, request: TransportRequest) -> Result<Box<dyn Cancelable>> {
        let (session, runtime) = self.prepare()?;
        let (cancel, cancelled) = CancelSignal::pair();
        tracing::debug!(target: targets::TRANSPORT, task = %request.task, url = %request.url, "background download started");

        runtime.spawn(async move {
            let task = request.task;
            let started = Instant::now();
            let bytes_sent = request.body.as_ref().map_or(0, |body| body.len() as u64);

            let outcome = tokio::select! {
                outcome = session.download(request) => outcome,
                Ok(()) = cancelled => Err(TransportError::cancelled()),
            };

            session.events.emit(&SessionEvent::Metrics {
                task,
                elapsed: started.elapsed(),
                bytes_sent,
                bytes_received: *outcome.as_ref().unwrap_or(&0),
            });
            session.finish(task, outcome.as_ref().err());
        });

        Ok(Box::new(cancel))
    }
}

impl Session {
    fn request(&self, request: TransportRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        builder
    }

    async fn execute(
        &self,
        request: TransportRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let task = request.task;
        let requested = request.url.clone();
        let response = self
            .request(request)
            .send()
            .await
            .map_err(transport_error)?;
        self.observe(task, &requested, &response);

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await.map_err(transport_error)?;

        Ok(TransportResponse {
            meta: Some(ResponseMeta {
                status,
                headers,
                url: Some(url),
            }),
            body: Some(body),
        })
    }

    /// Stream `contents` as the request body. Returns the response size.
    async fn upload(
        &self,
        mut request: TransportRequest,
        contents: Bytes,
    ) -> std::result::Result<u64, TransportError> {
        let task = request.task;
        let requested = request.url.clone();
        let total = contents.len() as u64;

        let events = self.events.clone();
        let chunks: Vec<Bytes> = contents
            .chunks(UPLOAD_CHUNK_SIZE)
            .map(|chunk| contents.slice_ref(chunk))
            .collect();
        let mut sent = 0u64;
        let body = stream::iter(chunks.into_iter().map(move |chunk| {
            sent += chunk.len() as u64;
            events.emit(&SessionEvent::UploadProgress {
                task,
                sent,
                total: Some(total),
            });
            Ok::<_, io::Error>(chunk)
        }));

        request.body = None;
        let response = self
            .request(request)
            .header(CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(transport_error)?;
        self.observe(task, &requested, &response);

        let status = response.status();
        let received = response.bytes().await.map_err(transport_error)?.len() as u64;
        if !status.is_success() {
            return Err(TransportError::new(
                TransportErrorKind::Other,
                format!("upload rejected with status {status}"),
            ));
        }
        Ok(received)
    }

    /// Stream the response body into the download directory. Returns the
    /// number of bytes written.
    ///
    /// The file is removed again unless the body is fully written, including
    /// when the future is dropped mid-body by a cancel.
    async fn download(&self, request: TransportRequest) -> std::result::Result<u64, TransportError> {
        let task = request.task;
        let requested = request.url.clone();
        let mut response = self
            .request(request)
            .send()
            .await
            .map_err(transport_error)?;
        self.observe(task, &requested, &response);

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::new(
                TransportErrorKind::Other,
                format!("download failed with status {status}"),
            ));
        }

        let total = response.content_length();
        let path = self
            .download_dir
            .join(download_file_name(task, response.url()));
        let partial = PartialDownload::new(path.clone());
        let mut file = tokio::fs::File::create(&path).await.map_err(io_error)?;

        let mut received = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
            file.write_all(&chunk).await.map_err(io_error)?;
            received += chunk.len() as u64;
            self.events.emit(&SessionEvent::DownloadProgress {
                task,
                received,
                total,
            });
        }
        file.flush().await.map_err(io_error)?;
        drop(file);
        let path = partial.keep();

        self.events
            .emit(&SessionEvent::DownloadFinished { task, path });
        Ok(received)
    }

    fn observe(&self, task: TaskId, requested: &Url, response: &reqwest::Response) {
        if response.url() != requested {
            self.events.emit(&SessionEvent::Redirect {
                task,
                from: requested.clone(),
                to: response.url().clone(),
            });
        }
        if response.status() == StatusCode::UNAUTHORIZED
            && let Some(challenge) = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
        {
            self.events.emit(&SessionEvent::AuthChallenge {
                task,
                challenge: challenge.to_string(),
            });
        }
    }

    fn finish(&self, task: TaskId, error: Option<&TransportError>) {
        if let Some(error) = error {
            tracing::debug!(target: targets::TRANSPORT, %task, %error, "task failed");
        }
        self.events.emit(&SessionEvent::TaskFinished {
            task,
            error: error.map(ToString::to_string),
        });
    }
}

fn build_client(settings: &ConnectionSettings) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();

    if let Some(timeout) = settings.timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(connect_timeout) = settings.connect_timeout {
        builder = builder.connect_timeout(connect_timeout);
    }

    if settings.follow_redirects {
        builder = builder.redirect(Policy::limited(settings.max_redirects));
    } else {
        builder = builder.redirect(Policy::none());
    }

    if settings.cookies_enabled {
        builder = builder.cookie_store(true);
    }
    if let Some(ref ua) = settings.user_agent {
        builder = builder.user_agent(ua);
    }
    if let Some(ref proxy_url) = settings.proxy {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| NetworkError::Configuration(format!("invalid proxy '{proxy_url}': {e}")))?;
        builder = builder.proxy(proxy);
    }
    if !settings.default_headers.is_empty() {
        builder = builder.default_headers(settings.default_headers.clone());
    }

    builder
        .build()
        .map_err(|e| NetworkError::Configuration(format!("cannot build HTTP client: {e}")))
}

/// Removes a download target on drop unless [`keep`](Self::keep) was called.
struct PartialDownload {
    path: Option<PathBuf>,
}

impl PartialDownload {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn keep(mut self) -> PathBuf {
        self.path.take().unwrap_or_default()
    }
}

impl Drop for PartialDownload {
    fn drop(&mut self) {
        if let Some(path) = self.path.take()
            && let Err(err) = std::fs::remove_file(&path)
            && err.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(
                target: targets::TRANSPORT,
                path = %path.display(),
                error = %err,
                "failed to remove partial download"
            );
        }
    }
}

fn download_file_name(task: TaskId, url: &Url) -> String {
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .unwrap_or("download");
    format!("{}-{}", task.as_u64(), name)
}

struct CancelSignal(Mutex<Option<oneshot::Sender<()>>>);

impl CancelSignal {
    fn pair() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(Mutex::new(Some(tx))), rx)
    }
}

impl Cancelable for CancelSignal {
    fn cancel(&self) {
        if let Some(tx) = self.0.lock().take() {
            let _ = tx.send(());
        }
    }
}

fn io_error(err: io::Error) -> TransportError {
    let kind = io_error_kind(&err).unwrap_or(TransportErrorKind::Other);
    TransportError::with_source(kind, err.to_string(), err)
}

fn transport_error(err: reqwest::Error) -> TransportError {
    let kind = reqwest_error_kind(&err);
    TransportError::with_source(kind, err.to_string(), err)
}

/// Classify a reqwest error by walking its source chain.
fn reqwest_error_kind(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_timeout() {
        return TransportErrorKind::TimedOut;
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if cause.is::<rustls::Error>() {
            return TransportErrorKind::Tls;
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>()
            && let Some(kind) = io_error_kind(io_err)
        {
            return kind;
        }
        let message = cause.to_string().to_ascii_lowercase();
        if message.contains("dns error") || message.contains("failed to lookup address") {
            return TransportErrorKind::Dns;
        }
        if message.contains("invalid peer certificate") || message.contains("tls handshake") {
            return TransportErrorKind::Tls;
        }
        source = cause.source();
    }

    if err.is_connect() {
        TransportErrorKind::ConnectionRefused
    } else {
        TransportErrorKind::Other
    }
}

fn io_error_kind(err: &io::Error) -> Option<TransportErrorKind> {
    if err.get_ref().is_some_and(|inner| inner.is::<rustls::Error>()) {
        return Some(TransportErrorKind::Tls);
    }
    match err.kind() {
        io::ErrorKind::ConnectionRefused => Some(TransportErrorKind::ConnectionRefused),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Some(TransportErrorKind::ConnectionLost),
        io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkDown
        | io::ErrorKind::NotConnected => Some(TransportErrorKind::Offline),
        io::ErrorKind::TimedOut => Some(TransportErrorKind::TimedOut),
        _ => None,
    }
}

static_assertions::assert_impl_all!(ReqwestTransport: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kinds() {
        let kind = |k: io::ErrorKind| io_error_kind(&io::Error::from(k));
        assert_eq!(kind(io::ErrorKind::ConnectionRefused), Some(TransportErrorKind::ConnectionRefused));
        assert_eq!(kind(io::ErrorKind::ConnectionReset), Some(TransportErrorKind::ConnectionLost));
        assert_eq!(kind(io::ErrorKind::NetworkUnreachable), Some(TransportErrorKind::Offline));
        assert_eq!(kind(io::ErrorKind::TimedOut), Some(TransportErrorKind::TimedOut));
        assert_eq!(kind(io::ErrorKind::PermissionDenied), None);
    }

    #[test]
    fn test_rustls_error_inside_io_error_is_tls() {
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::Expired),
        );
        assert_eq!(io_error_kind(&err), Some(TransportErrorKind::Tls));
    }

    #[test]
    fn test_download_file_name() {
        let task = TaskId::next();
        let id = task.as_u64();

        let url = Url::parse("https://cdn.example.com/files/report.pdf?sig=1").unwrap();
        assert_eq!(download_file_name(task, &url), format!("{id}-report.pdf"));

        let url = Url::parse("https://cdn.example.com/").unwrap();
        assert_eq!(download_file_name(task, &url), format!("{id}-download"));
    }

    #[test]
    fn test_partial_download_removed_unless_kept() {
        let dir = tempfile::tempdir().unwrap();

        let dropped = dir.path().join("1-dropped.bin");
        std::fs::write(&dropped, b"partial").unwrap();
        drop(PartialDownload::new(dropped.clone()));
        assert!(!dropped.exists());

        let kept = dir.path().join("2-kept.bin");
        std::fs::write(&kept, b"complete").unwrap();
        assert_eq!(PartialDownload::new(kept.clone()).keep(), kept);
        assert_eq!(std::fs::read(&kept).unwrap(), b"complete");
    }

    #[test]
    fn test_cancel_signal_fires_once() {
        let (signal, mut rx) = CancelSignal::pair();
        signal.cancel();
        signal.cancel();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_build_client_from_settings() {
        let settings = ConnectionSettings::default()
            .no_redirects()
            .no_cookies()
            .user_agent("courier-test");
        assert!(build_client(&settings).is_ok());
    }

    #[test]
    fn test_unconfigured_transport_fails_completion() {
        let transport = ReqwestTransport::new();
        let (tx, rx) = std::sync::mpsc::channel();
        transport.submit(
            TransportRequest {
                task: TaskId::next(),
                method: http::Method::GET,
                url: Url::parse("http://localhost/").unwrap(),
                headers: http::HeaderMap::new(),
                body: None,
            },
            Box::new(move |outcome| {
                let _ = tx.send(outcome.map(|_| ()).map_err(|e| e.kind()));
            }),
        );
        assert_eq!(rx.recv().unwrap(), Err(TransportErrorKind::Other));
    }
}
