//! Dispatch contexts for delivering callbacks on one fixed execution context.
//!
//! Transports complete requests and report progress on whatever thread they
//! happen to run on. Everything the engine hands back to its caller is
//! re-dispatched through a [`DispatchContext`] so that callers observe all
//! results and progress updates on a single context, in submission order, and
//! never need to synchronize their handlers.
//!
//! Two implementations are provided:
//!
//! - [`SerialQueue`]: a dedicated named thread draining a FIFO job queue. This
//!   is the default context for a configured engine.
//! - [`PumpedQueue`]: jobs accumulate until the owning context calls
//!   [`PumpedQueue::process_pending`], which suits applications that already
//!   run their own main loop (and deterministic tests).
//!
//! # Example
//!
//! ```no_run
//! use courier_core::{DispatchContext, SerialQueue};
//!
//! let queue = SerialQueue::spawn_named("ui-callbacks").unwrap();
//! queue.dispatch(Box::new(|| println!("runs on ui-callbacks")));
//! queue.stop_and_join();
//! ```

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::Mutex;

use crate::error::{CoreError, Result};
use crate::logging::targets;

/// A unit of work delivered to a dispatch context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// An execution context that runs jobs one at a time, in the order received.
pub trait DispatchContext: Send + Sync + 'static {
    /// Queue a job for execution on this context.
    fn dispatch(&self, job: Job);

    /// Whether the calling thread is this context's thread.
    fn is_current(&self) -> bool;
}

/// Configuration for a [`SerialQueue`].
#[derive(Debug, Clone)]
pub struct SerialQueueConfig {
    /// Name for the dispatch thread.
    pub name: String,
    /// Stack size for the dispatch thread in bytes. `None` uses the default.
    pub stack_size: Option<usize>,
}

impl Default for SerialQueueConfig {
    fn default() -> Self {
        Self {
            name: "courier-dispatch".to_string(),
            stack_size: None,
        }
    }
}

struct QueueState {
    running: AtomicBool,
    pending: AtomicUsize,
}

/// A dedicated thread that executes dispatched jobs sequentially.
///
/// Jobs are never dropped while the queue is running: the channel is
/// unbounded, and a job that panics is logged without taking the thread down.
/// After [`stop`](Self::stop), remaining jobs are drained before the thread
/// exits and new jobs are rejected with a warning.
pub struct SerialQueue {
    // Taken by `stop`; the worker drains until every sender is gone.
    sender: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    state: Arc<QueueState>,
}

impl SerialQueue {
    /// Start a serial queue with default configuration.
    pub fn spawn() -> Result<Self> {
        Self::with_config(SerialQueueConfig::default())
    }

    /// Start a serial queue whose thread carries the given name.
    pub fn spawn_named(name: impl Into<String>) -> Result<Self> {
        Self::with_config(SerialQueueConfig {
            name: name.into(),
            ..Default::default()
        })
    }

    /// Start a serial queue with custom configuration.
    pub fn with_config(config: SerialQueueConfig) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let state = Arc::new(QueueState {
            running: AtomicBool::new(true),
            pending: AtomicUsize::new(0),
        });

        let mut builder = thread::Builder::new().name(config.name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let thread_state = state.clone();
        let handle = builder
            .spawn(move || {
                queue_loop(receiver, &thread_state);
                thread_state.running.store(false, Ordering::Release);
            })
            .map_err(|source| CoreError::Spawn {
                name: config.name.clone(),
                source,
            })?;

        tracing::debug!(target: targets::DISPATCH, name = %config.name, "serial queue started");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
            state,
        })
    }

    /// Check if the queue still accepts jobs.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Number of jobs queued but not yet finished.
    pub fn pending_jobs(&self) -> usize {
        self.state.pending.load(Ordering::Acquire)
    }

    /// Block until every job dispatched before this call has run.
    ///
    /// Returns `false` if the timeout elapsed first or the queue is stopped.
    /// Calling this from the queue's own thread returns `false` immediately.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        if self.is_current() || !self.is_running() {
            return false;
        }
        let (done_tx, done_rx) = bounded(1);
        self.dispatch(Box::new(move || {
            let _ = done_tx.send(());
        }));
        done_rx.recv_timeout(timeout).is_ok()
    }

    /// Request the queue to stop after running the jobs already queued.
    ///
    /// Non-blocking. Use [`join`](Self::join) to wait for the thread.
    pub fn stop(&self) {
        let sender = self.sender.lock().take();
        if sender.is_some() {
            self.state.running.store(false, Ordering::Release);
        }
    }

    /// Wait for the queue thread to exit.
    ///
    /// Returns `false` when already joined, when called from the queue
    /// thread itself, or when the thread panicked.
    pub fn join(&self) -> bool {
        if self.is_current() {
            return false;
        }
        match self.handle.lock().take() {
            Some(handle) => handle.join().is_ok(),
            None => false,
        }
    }

    /// Stop the queue and wait for it to finish.
    pub fn stop_and_join(&self) -> bool {
        self.stop();
        self.join()
    }
}

impl DispatchContext for SerialQueue {
    fn dispatch(&self, job: Job) {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            tracing::warn!(target: targets::DISPATCH, "serial queue stopped, job discarded");
            return;
        };
        self.state.pending.fetch_add(1, Ordering::AcqRel);
        if sender.send(job).is_err() {
            self.state.pending.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(target: targets::DISPATCH, "serial queue disconnected, job discarded");
        }
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        // Don't block in drop - just request shutdown
        self.stop();
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("running", &self.is_running())
            .field("pending_jobs", &self.pending_jobs())
            .finish()
    }
}

fn queue_loop(receiver: Receiver<Job>, state: &QueueState) {
    while let Ok(job) = receiver.recv() {
        run_job(job, state);
    }
    tracing::debug!(target: targets::DISPATCH, "serial queue exited");
}

fn run_job(job: Job, state: &QueueState) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!(target: targets::DISPATCH, "dispatched job panicked");
    }
    state.pending.fetch_sub(1, Ordering::AcqRel);
}

/// A job queue drained explicitly by its owning context.
///
/// The thread that creates the queue is considered its context. Applications
/// with an existing main loop call [`process_pending`](Self::process_pending)
/// once per iteration.
pub struct PumpedQueue {
    jobs: Mutex<VecDeque<Job>>,
    owner: ThreadId,
}

impl PumpedQueue {
    /// Create a queue owned by the calling thread.
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            owner: thread::current().id(),
        }
    }

    /// Number of jobs waiting to run.
    pub fn pending_count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Check if there are jobs waiting to run.
    pub fn has_pending(&self) -> bool {
        !self.jobs.lock().is_empty()
    }

    /// Run queued jobs until the queue is empty.
    ///
    /// Jobs dispatched by running jobs are processed in the same call. The
    /// lock is never held while a job runs. Returns the number of jobs run.
    pub fn process_pending(&self) -> usize {
        let mut processed = 0;
        loop {
            let batch: VecDeque<Job> = std::mem::take(&mut *self.jobs.lock());
            if batch.is_empty() {
                return processed;
            }
            for job in batch {
                job();
                processed += 1;
            }
        }
    }
}

impl Default for PumpedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchContext for PumpedQueue {
    fn dispatch(&self, job: Job) {
        self.jobs.lock().push_back(job);
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.owner
    }
}

impl std::fmt::Debug for PumpedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PumpedQueue")
            .field("pending", &self.pending_count())
            .finish()
    }
}

static_assertions::assert_impl_all!(SerialQueue: Send, Sync);
static_assertions::assert_impl_all!(PumpedQueue: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_queue_runs_jobs_in_order() {
        let queue = SerialQueue::spawn().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        for i in 0..50 {
            let received = received.clone();
            queue.dispatch(Box::new(move || received.lock().push(i)));
        }

        assert!(queue.wait_idle(Duration::from_secs(5)));
        assert_eq!(*received.lock(), (0..50).collect::<Vec<_>>());
        assert!(queue.stop_and_join());
    }

    #[test]
    fn test_serial_queue_uses_single_thread() {
        let queue = Arc::new(SerialQueue::spawn_named("single").unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut producers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            let seen = seen.clone();
            producers.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    let seen = seen.clone();
                    queue.dispatch(Box::new(move || {
                        seen.lock().push(std::thread::current().id());
                    }));
                }
            }));
        }
        for producer in producers {
            producer.join().unwrap();
        }

        assert!(queue.wait_idle(Duration::from_secs(5)));
        let seen = seen.lock();
        assert_eq!(seen.len(), 40);
        assert!(seen.iter().all(|id| *id == seen[0]));
        assert_ne!(seen[0], std::thread::current().id());
    }

    #[test]
    fn test_serial_queue_is_current() {
        let queue = Arc::new(SerialQueue::spawn().unwrap());
        assert!(!queue.is_current());

        let (tx, rx) = bounded(1);
        let inner = queue.clone();
        queue.dispatch(Box::new(move || {
            let _ = tx.send(inner.is_current());
        }));
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_serial_queue_survives_panicking_job() {
        let queue = SerialQueue::spawn().unwrap();
        queue.dispatch(Box::new(|| panic!("boom")));

        let (tx, rx) = bounded(1);
        queue.dispatch(Box::new(move || {
            let _ = tx.send(42);
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_serial_queue_drains_on_stop() {
        let queue = SerialQueue::spawn().unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let count = count.clone();
            queue.dispatch(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(queue.stop_and_join());
        assert_eq!(count.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_serial_queue_rejects_after_stop() {
        let queue = SerialQueue::spawn().unwrap();
        queue.stop_and_join();

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        queue.dispatch(Box::new(move || ran_clone.store(true, Ordering::SeqCst)));

        assert!(!queue.is_running());
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(queue.pending_jobs(), 0);
        assert!(!queue.wait_idle(Duration::from_millis(10)));
    }

    #[test]
    fn test_serial_queue_stop_races_dispatch() {
        let queue = Arc::new(SerialQueue::spawn().unwrap());
        let ran = Arc::new(AtomicUsize::new(0));

        let mut producers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            let ran = ran.clone();
            producers.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    let ran = ran.clone();
                    queue.dispatch(Box::new(move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                    }));
                }
            }));
        }
        std::thread::sleep(Duration::from_millis(1));
        assert!(queue.stop_and_join());
        for producer in producers {
            producer.join().unwrap();
        }

        // Every accepted job ran; every rejected one was never counted.
        assert_eq!(queue.pending_jobs(), 0);
        assert!(ran.load(Ordering::SeqCst) <= 2000);
        assert!(!queue.is_running());
    }

    #[test]
    fn test_pumped_queue_defers_until_processed() {
        let queue = PumpedQueue::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let received = received.clone();
            queue.dispatch(Box::new(move || received.lock().push(i)));
        }

        assert_eq!(queue.pending_count(), 3);
        assert!(received.lock().is_empty());

        assert_eq!(queue.process_pending(), 3);
        assert_eq!(*received.lock(), vec![0, 1, 2]);
        assert!(!queue.has_pending());
    }

    #[test]
    fn test_pumped_queue_runs_nested_dispatch() {
        let queue = Arc::new(PumpedQueue::new());
        let received = Arc::new(Mutex::new(Vec::new()));

        let inner_queue = queue.clone();
        let inner_received = received.clone();
        queue.dispatch(Box::new(move || {
            inner_received.lock().push("outer");
            let nested = inner_received.clone();
            inner_queue.dispatch(Box::new(move || nested.lock().push("nested")));
        }));

        assert_eq!(queue.process_pending(), 2);
        assert_eq!(*received.lock(), vec!["outer", "nested"]);
    }

    #[test]
    fn test_pumped_queue_owner_thread() {
        let queue = Arc::new(PumpedQueue::new());
        assert!(queue.is_current());

        let other = queue.clone();
        let on_other = std::thread::spawn(move || other.is_current())
            .join()
            .unwrap();
        assert!(!on_other);
    }
}
