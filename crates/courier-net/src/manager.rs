//! The network manager façade.
//!
//! [`NetworkManager`] ties the engine together. A submission resolves the
//! endpoint, builds a transport request, hands it to the transport and,
//! when the transport completes, processes the response and delivers the
//! result on the configured dispatch context.
//!
//! Two delivery forms share one internal primitive:
//!
//! - [`NetworkManager::submit`] takes a completion callback.
//! - [`NetworkManager::submit_stream`] returns a cold, single-value
//!   [`ResponseStream`].
//!
//! Background transfers ([`submit_background_upload`] and
//! [`submit_background_download`]) report progress only, through a
//! [`ProgressTracker`] registered with the session delegate.
//!
//! [`submit_background_upload`]: NetworkManager::submit_background_upload
//! [`submit_background_download`]: NetworkManager::submit_background_download
//!
//! # Example
//!
//! ```ignore
//! use courier_net::{NetworkManager, RequestDescriptor};
//!
//! #[derive(serde::Deserialize)]
//! struct Widget {
//!     id: String,
//!     name: String,
//! }
//!
//! let descriptor = RequestDescriptor::get("/widgets/{id}")
//!     .path_param("id", "1")
//!     .build();
//!
//! // Callback form
//! let handle = manager.submit::<Widget>(&descriptor, |result| match result {
//!     Ok(widget) => println!("got {}", widget.name),
//!     Err(err) => eprintln!("failed: {err}"),
//! });
//!
//! // Stream form
//! let widget: Widget = manager.submit_stream(&descriptor).single().await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_util::future::FutureExt;
use futures_util::stream::{FusedStream, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use courier_core::logging::targets;

use crate::builder::build_transport_request;
use crate::codec::CodecLookup;
use crate::config::EngineConfiguration;
use crate::delegate::{DelegateMulticaster, SessionEvent, SessionObserver};
use crate::error::{NetworkError, Result};
use crate::progress::{ProgressTracker, TransferDirection, TransferProgress};
use crate::request::RequestDescriptor;
use crate::response::process_response;
use crate::task::{Cancelable, TaskHandle, TaskId, TaskState};
use crate::transport::{TransportCompletion, TransportRequest};

type Completion<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// The installed configuration plus the multicaster it reports to.
struct Engine {
    config: EngineConfiguration,
    delegate: Arc<DelegateMulticaster>,
}

impl Engine {
    fn build_request(&self, task: TaskId, descriptor: &RequestDescriptor) -> Result<TransportRequest> {
        let url = self
            .config
            .resolver()
            .resolve(descriptor, self.config.settings())?;
        let codecs = CodecLookup::new(
            descriptor.codecs().map(|c| c.as_ref()),
            self.config.codecs(),
        );
        build_transport_request(task, url, descriptor, &codecs)
    }
}

struct BackgroundTransfer {
    tracker: Arc<dyn SessionObserver>,
    handle: TaskHandle,
}

type TransferMap = Mutex<HashMap<TaskId, BackgroundTransfer>>;

/// Retires background transfers when the transport reports them finished.
struct TransferJanitor {
    transfers: Weak<TransferMap>,
}

impl SessionObserver for TransferJanitor {
    fn on_event(&self, event: &SessionEvent) {
        let SessionEvent::TaskFinished { task, error } = event else {
            return;
        };
        let Some(transfers) = self.transfers.upgrade() else {
            return;
        };
        let finished = transfers.lock().remove(task);
        if let Some(transfer) = finished {
            let state = if error.is_some() {
                TaskState::Failed
            } else {
                TaskState::Completed
            };
            transfer.handle.finish(state);
            tracing::debug!(target: targets::ENGINE, %task, ?state, "background transfer finished");
        }
    }
}

struct Inner {
    engine: RwLock<Option<Arc<Engine>>>,
    default_delegate: Arc<DelegateMulticaster>,
    transfers: Arc<TransferMap>,
    janitor: Arc<dyn SessionObserver>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.get_mut().take() {
            engine.delegate.clear();
        }
        self.default_delegate.clear();
        self.transfers.lock().clear();
    }
}

/// Entry point for submitting requests.
///
/// Cheap to clone; clones share configuration, observers and in-flight
/// background transfers. Dropping the last clone releases every observer.
#[derive(Clone)]
pub struct NetworkManager {
    inner: Arc<Inner>,
}

impl NetworkManager {
    /// Create an unconfigured manager.
    pub fn new() -> Self {
        let transfers: Arc<TransferMap> = Arc::new(Mutex::new(HashMap::new()));
        let janitor: Arc<dyn SessionObserver> = Arc::new(TransferJanitor {
            transfers: Arc::downgrade(&transfers),
        });
        Self {
            inner: Arc::new(Inner {
                engine: RwLock::new(None),
                default_delegate: Arc::new(DelegateMulticaster::new()),
                transfers,
                janitor,
            }),
        }
    }

    /// Install a configuration, replacing any previous one.
    ///
    /// The transport is configured first; if that fails the previous
    /// configuration stays in place. Requests already in flight keep the
    /// configuration they were submitted with.
    #[tracing::instrument(skip_all, target = "courier_net::engine")]
    pub fn configure(&self, config: EngineConfiguration) -> Result<()> {
        let delegate = config
            .session_delegate()
            .cloned()
            .unwrap_or_else(|| self.inner.default_delegate.clone());
        config
            .transport()
            .configure(config.settings(), delegate.clone())?;
        delegate.add(&self.inner.janitor);

        let base_url = config.settings().base_url.as_ref().map(ToString::to_string);
        *self.inner.engine.write() = Some(Arc::new(Engine { config, delegate }));
        tracing::debug!(target: targets::ENGINE, ?base_url, "network manager configured");
        Ok(())
    }

    /// Check if a configuration is installed.
    pub fn is_configured(&self) -> bool {
        self.inner.engine.read().is_some()
    }

    /// Remove the configuration and release every observer and tracker.
    ///
    /// Requests already in flight still complete and deliver their result.
    pub fn teardown(&self) {
        if let Some(engine) = self.inner.engine.write().take() {
            engine.delegate.clear();
        }
        self.inner.default_delegate.clear();
        self.inner.transfers.lock().clear();
        tracing::debug!(target: targets::ENGINE, "network manager torn down");
    }

    /// Register a session observer with the active delegate.
    ///
    /// The manager does not keep the observer alive. Returns `false` if it
    /// was already registered.
    pub fn add_observer(&self, observer: &Arc<dyn SessionObserver>) -> bool {
        self.delegate().add(observer)
    }

    /// Unregister a session observer. Returns `false` if it was not registered.
    pub fn remove_observer(&self, observer: &Arc<dyn SessionObserver>) -> bool {
        self.delegate().remove(observer)
    }

    /// The multicaster session events are currently sent to.
    pub fn delegate(&self) -> Arc<DelegateMulticaster> {
        match self.engine() {
            Some(engine) => engine.delegate.clone(),
            None => self.inner.default_delegate.clone(),
        }
    }

    /// Submit a request and receive the decoded result through `completion`.
    ///
    /// The completion runs exactly once. When the request cannot be built
    /// (endpoint resolution or body encoding failed) it receives the error
    /// on the dispatch context, no transport call is made and `None` is
    /// returned. Submitting before [`configure`](Self::configure) calls the
    /// completion immediately on the calling thread with
    /// [`NetworkError::NotConfigured`], as there is no dispatch context yet.
    pub fn submit<T>(
        &self,
        descriptor: &RequestDescriptor,
        completion: impl FnOnce(Result<T>) + Send + 'static,
    ) -> Option<TaskHandle>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.submit_and_classify(descriptor, Box::new(completion))
    }

    /// Submit a request and receive the decoded result as a stream.
    ///
    /// Nothing is sent until the stream is first polled. The stream yields
    /// exactly one item, then ends. Dropping it before that cancels the task.
    pub fn submit_stream<T>(&self, descriptor: &RequestDescriptor) -> ResponseStream<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        ResponseStream {
            manager: self.clone(),
            descriptor: descriptor.clone(),
            state: StreamState::Idle,
        }
    }

    /// Upload the descriptor's encoded body in the background.
    ///
    /// The body is written to a temporary file which the transport reads
    /// before this call returns; the file is removed on every path out of
    /// this function. Progress is delivered to `progress` on the dispatch
    /// context. An `Err` means no upload was started.
    #[tracing::instrument(skip_all, target = "courier_net::engine", fields(path = descriptor.path()))]
    pub fn submit_background_upload(
        &self,
        descriptor: &RequestDescriptor,
        progress: impl Fn(TransferProgress) + Send + Sync + 'static,
    ) -> Result<TaskHandle> {
        let engine = self.engine().ok_or(NetworkError::NotConfigured)?;
        let task = TaskId::next();
        let mut request = engine.build_request(task, descriptor)?;
        let body = request.body.take().unwrap_or_default();

        let mut file = tempfile::Builder::new()
            .prefix("courier-upload-")
            .tempfile()?;
        file.write_all(&body)?;
        file.flush()?;

        let handle = self.begin_transfer(&engine, task, TransferDirection::Upload, Arc::new(progress));
        let submitted = engine
            .config
            .transport()
            .submit_background_upload(request, file.path());
        drop(file);

        self.complete_transfer_submission(&engine, handle, submitted)
    }

    /// Download the descriptor's endpoint in the background.
    ///
    /// Progress is delivered to `progress` on the dispatch context. The
    /// transport reports where the file was written with a
    /// [`SessionEvent::DownloadFinished`] event. An `Err` means no download
    /// was started.
    #[tracing::instrument(skip_all, target = "courier_net::engine", fields(path = descriptor.path()))]
    pub fn submit_background_download(
        &self,
        descriptor: &RequestDescriptor,
        progress: impl Fn(TransferProgress) + Send + Sync + 'static,
    ) -> Result<TaskHandle> {
        let engine = self.engine().ok_or(NetworkError::NotConfigured)?;
        let task = TaskId::next();
        let request = engine.build_request(task, descriptor)?;

        let handle = self.begin_transfer(&engine, task, TransferDirection::Download, Arc::new(progress));
        let submitted = engine
            .config
            .transport()
            .submit_background_download(request);

        self.complete_transfer_submission(&engine, handle, submitted)
    }

    /// Number of background transfers still being tracked.
    pub fn active_transfers(&self) -> usize {
        self.inner.transfers.lock().len()
    }

    fn engine(&self) -> Option<Arc<Engine>> {
        self.inner.engine.read().clone()
    }

    /// The one submission path behind both delivery forms.
    ///
    /// `deliver` always runs on the dispatch context, except for the
    /// not-configured case where no context exists.
    fn submit_and_classify<T>(
        &self,
        descriptor: &RequestDescriptor,
        deliver: Completion<T>,
    ) -> Option<TaskHandle>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let Some(engine) = self.engine() else {
            tracing::warn!(target: targets::ENGINE, path = descriptor.path(), "submit before configure");
            deliver(Err(NetworkError::NotConfigured));
            return None;
        };
        let dispatcher = engine.config.dispatcher().clone();

        let task = TaskId::next();
        let request = match engine.build_request(task, descriptor) {
            Ok(request) => request,
            Err(error) => {
                tracing::debug!(target: targets::ENGINE, %task, %error, "request build failed");
                dispatcher.dispatch(Box::new(move || deliver(Err(error))));
                return None;
            }
        };

        tracing::debug!(
            target: targets::ENGINE,
            %task,
            method = %request.method,
            url = %request.url,
            "submitting request"
        );

        let handle = TaskHandle::new(task);
        let slot: Arc<Mutex<Option<Completion<T>>>> = Arc::new(Mutex::new(Some(deliver)));

        {
            let slot = slot.clone();
            let dispatcher = dispatcher.clone();
            handle.on_cancel(move || {
                if let Some(deliver) = slot.lock().take() {
                    dispatcher.dispatch(Box::new(move || deliver(Err(NetworkError::Cancelled))));
                }
            });
        }

        let completion: TransportCompletion = {
            let handle = handle.clone();
            let engine = engine.clone();
            let response_type = descriptor.response_content_type().clone();
            let local_codecs = descriptor.codecs().cloned();
            Box::new(move |outcome| {
                let codecs = CodecLookup::new(local_codecs.as_deref(), engine.config.codecs());
                let result = process_response::<T>(outcome, &response_type, &codecs);
                let state = match &result {
                    Ok(_) => TaskState::Completed,
                    Err(NetworkError::Cancelled) => TaskState::Cancelled,
                    Err(_) => TaskState::Failed,
                };
                if !handle.finish(state) {
                    tracing::trace!(target: targets::ENGINE, task = %handle.id(), "late completion dropped");
                    return;
                }
                tracing::debug!(target: targets::ENGINE, task = %handle.id(), ?state, "request finished");
                if let Some(deliver) = slot.lock().take() {
                    engine
                        .config
                        .dispatcher()
                        .dispatch(Box::new(move || deliver(result)));
                }
            })
        };

        let cancelable = engine.config.transport().submit(request, completion);
        handle.attach(cancelable);
        Some(handle)
    }

    fn begin_transfer(
        &self,
        engine: &Engine,
        task: TaskId,
        direction: TransferDirection,
        progress: Arc<dyn Fn(TransferProgress) + Send + Sync + 'static>,
    ) -> TaskHandle {
        let tracker: Arc<dyn SessionObserver> = Arc::new(ProgressTracker::new(
            task,
            direction,
            progress,
            engine.config.dispatcher().clone(),
        ));
        let handle = TaskHandle::new(task);

        self.inner.transfers.lock().insert(
            task,
            BackgroundTransfer {
                tracker: tracker.clone(),
                handle: handle.clone(),
            },
        );
        engine.delegate.add(&tracker);

        let transfers = Arc::downgrade(&self.inner.transfers);
        let delegate = Arc::downgrade(&engine.delegate);
        handle.on_cancel(move || {
            retire_transfer(&transfers, &delegate, task);
        });

        tracing::debug!(target: targets::ENGINE, %task, ?direction, "background transfer registered");
        handle
    }

    fn complete_transfer_submission(
        &self,
        engine: &Engine,
        handle: TaskHandle,
        submitted: Result<Box<dyn Cancelable>>,
    ) -> Result<TaskHandle> {
        match submitted {
            Ok(cancelable) => {
                handle.attach(cancelable);
                Ok(handle)
            }
            Err(error) => {
                tracing::warn!(target: targets::ENGINE, task = %handle.id(), %error, "background transfer rejected by transport");
                handle.finish(TaskState::Failed);
                retire_transfer(
                    &Arc::downgrade(&self.inner.transfers),
                    &Arc::downgrade(&engine.delegate),
                    handle.id(),
                );
                Err(error)
            }
        }
    }
}

fn retire_transfer(transfers: &Weak<TransferMap>, delegate: &Weak<DelegateMulticaster>, task: TaskId) {
    let removed = transfers
        .upgrade()
        .and_then(|transfers| transfers.lock().remove(&task));
    if let (Some(transfer), Some(delegate)) = (removed, delegate.upgrade()) {
        delegate.remove(&transfer.tracker);
    }
}

impl Default for NetworkManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkManager")
            .field("configured", &self.is_configured())
            .field("observers", &self.delegate().len())
            .field("active_transfers", &self.active_transfers())
            .finish()
    }
}

enum StreamState<T> {
    Idle,
    Waiting {
        outcome: oneshot::Receiver<Result<T>>,
        handle: Option<TaskHandle>,
    },
    Done,
}

/// A cold, single-value stream of one request's result.
///
/// Created by [`NetworkManager::submit_stream`]. The request is submitted
/// on first poll. Dropping the stream while the request is in flight
/// cancels it.
#[must_use = "streams do nothing unless polled"]
pub struct ResponseStream<T> {
    manager: NetworkManager,
    descriptor: RequestDescriptor,
    state: StreamState<T>,
}

impl<T> Unpin for ResponseStream<T> {}

impl<T> ResponseStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Await the single result.
    pub async fn single(mut self) -> Result<T> {
        self.next().await.unwrap_or(Err(NetworkError::Cancelled))
    }

    /// The task handle, once the request has been submitted.
    pub fn handle(&self) -> Option<&TaskHandle> {
        match &self.state {
            StreamState::Waiting { handle, .. } => handle.as_ref(),
            StreamState::Idle | StreamState::Done => None,
        }
    }
}

impl<T> Stream for ResponseStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                StreamState::Idle => {
                    let (tx, outcome) = oneshot::channel();
                    let handle = this.manager.submit_and_classify::<T>(
                        &this.descriptor,
                        Box::new(move |result| {
                            let _ = tx.send(result);
                        }),
                    );
                    this.state = StreamState::Waiting { outcome, handle };
                }
                StreamState::Waiting { outcome, .. } => {
                    let item = match outcome.poll_unpin(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Ok(result)) => result,
                        // The dispatch context went away with the delivery.
                        Poll::Ready(Err(_)) => Err(NetworkError::Cancelled),
                    };
                    this.state = StreamState::Done;
                    return Poll::Ready(Some(item));
                }
                StreamState::Done => return Poll::Ready(None),
            }
        }
    }
}

impl<T> FusedStream for ResponseStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn is_terminated(&self) -> bool {
        matches!(self.state, StreamState::Done)
    }
}

impl<T> Drop for ResponseStream<T> {
    fn drop(&mut self) {
        if let StreamState::Waiting {
            handle: Some(handle),
            ..
        } = &self.state
            && handle.cancel()
        {
            tracing::debug!(target: targets::ENGINE, task = %handle.id(), "response stream dropped before completion");
        }
    }
}

impl<T> fmt::Debug for ResponseStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            StreamState::Idle => "idle",
            StreamState::Waiting { .. } => "waiting",
            StreamState::Done => "done",
        };
        f.debug_struct("ResponseStream")
            .field("path", &self.descriptor.path())
            .field("state", &state)
            .finish()
    }
}

static_assertions::assert_impl_all!(NetworkManager: Send, Sync);
