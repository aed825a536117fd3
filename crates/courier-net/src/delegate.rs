//! Session events and the delegate multicaster.
//!
//! Transports report low-level session activity (redirects, auth challenges,
//! transfer progress, metrics, task completion) as [`SessionEvent`]s sent to
//! a [`DelegateMulticaster`], which fans each event out to every registered
//! [`SessionObserver`]. Progress trackers created by the engine register
//! here too, so they see transfer events exactly like external observers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use courier_core::ObserverSet;
use courier_core::logging::targets;
use url::Url;

use crate::task::TaskId;

/// A low-level session event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The request was redirected.
    Redirect {
        /// The task.
        task: TaskId,
        /// The URL originally requested.
        from: Url,
        /// The URL finally reached.
        to: Url,
    },
    /// The server issued an authentication challenge.
    AuthChallenge {
        /// The task.
        task: TaskId,
        /// The `WWW-Authenticate` header value.
        challenge: String,
    },
    /// Upload progress.
    UploadProgress {
        /// The task.
        task: TaskId,
        /// Bytes sent so far.
        sent: u64,
        /// Total bytes to send, if known.
        total: Option<u64>,
    },
    /// Download progress.
    DownloadProgress {
        /// The task.
        task: TaskId,
        /// Bytes received so far.
        received: u64,
        /// Total bytes expected, if known.
        total: Option<u64>,
    },
    /// A background download was written to disk.
    DownloadFinished {
        /// The task.
        task: TaskId,
        /// Where the file was written.
        path: PathBuf,
    },
    /// Timing and volume for a finished transfer.
    Metrics {
        /// The task.
        task: TaskId,
        /// Time from start to finish.
        elapsed: Duration,
        /// Body bytes sent.
        bytes_sent: u64,
        /// Body bytes received.
        bytes_received: u64,
    },
    /// The transport is done with the task.
    TaskFinished {
        /// The task.
        task: TaskId,
        /// A description of the failure, if the task failed.
        error: Option<String>,
    },
}

impl SessionEvent {
    /// The task this event belongs to.
    pub fn task(&self) -> TaskId {
        match self {
            Self::Redirect { task, .. }
            | Self::AuthChallenge { task, .. }
            | Self::UploadProgress { task, .. }
            | Self::DownloadProgress { task, .. }
            | Self::DownloadFinished { task, .. }
            | Self::Metrics { task, .. }
            | Self::TaskFinished { task, .. } => *task,
        }
    }
}

/// Receives session events.
///
/// Observers are called on the transport's thread. They must not block.
pub trait SessionObserver: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &SessionEvent);
}

/// Fans session events out to weakly held observers.
///
/// Registration is idempotent by identity and never keeps an observer alive.
/// Membership is guarded by one mutex; events are delivered to a snapshot
/// taken under it, so observers added or removed during delivery only affect
/// later events.
#[derive(Debug, Default)]
pub struct DelegateMulticaster {
    observers: ObserverSet<dyn SessionObserver>,
}

impl DelegateMulticaster {
    /// Create an empty multicaster.
    pub fn new() -> Self {
        Self {
            observers: ObserverSet::new(),
        }
    }

    /// Register an observer. Returns `false` if it was already registered.
    pub fn add(&self, observer: &Arc<dyn SessionObserver>) -> bool {
        self.observers.add(observer)
    }

    /// Unregister an observer. Returns `false` if it was not registered.
    pub fn remove(&self, observer: &Arc<dyn SessionObserver>) -> bool {
        self.observers.remove(observer)
    }

    /// Check whether an observer is registered.
    pub fn contains(&self, observer: &Arc<dyn SessionObserver>) -> bool {
        self.observers.contains(observer)
    }

    /// Number of live observers.
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Check if no live observers are registered.
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Deliver an event to every registered observer.
    pub fn emit(&self, event: &SessionEvent) {
        match event {
            SessionEvent::UploadProgress { .. } | SessionEvent::DownloadProgress { .. } => {
                tracing::trace!(target: targets::DELEGATE, task = %event.task(), ?event, "session event");
            }
            _ => {
                tracing::debug!(target: targets::DELEGATE, task = %event.task(), ?event, "session event");
            }
        }
        self.observers.emit(|observer| observer.on_event(event));
    }

    /// Release every observer.
    pub fn clear(&self) {
        self.observers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SessionEvent>>);

    impl SessionObserver for Recorder {
        fn on_event(&self, event: &SessionEvent) {
            self.0.lock().push(event.clone());
        }
    }

    fn finished(task: TaskId) -> SessionEvent {
        SessionEvent::TaskFinished { task, error: None }
    }

    #[test]
    fn test_emit_reaches_all_observers() {
        let multicaster = DelegateMulticaster::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let a_dyn: Arc<dyn SessionObserver> = a.clone();
        let b_dyn: Arc<dyn SessionObserver> = b.clone();
        multicaster.add(&a_dyn);
        multicaster.add(&b_dyn);

        let task = TaskId::next();
        multicaster.emit(&finished(task));

        assert_eq!(*a.0.lock(), vec![finished(task)]);
        assert_eq!(*b.0.lock(), vec![finished(task)]);
    }

    #[test]
    fn test_add_twice_remove_once_leaves_none() {
        let multicaster = DelegateMulticaster::new();
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn SessionObserver> = recorder.clone();

        assert!(multicaster.add(&observer));
        assert!(!multicaster.add(&observer));
        assert!(multicaster.remove(&observer));
        assert!(multicaster.is_empty());

        multicaster.emit(&finished(TaskId::next()));
        assert!(recorder.0.lock().is_empty());
    }

    #[test]
    fn test_remove_unregistered_is_noop() {
        let multicaster = DelegateMulticaster::new();
        let observer: Arc<dyn SessionObserver> = Arc::new(Recorder::default());
        assert!(!multicaster.remove(&observer));
    }

    #[test]
    fn test_does_not_own_observers() {
        let multicaster = DelegateMulticaster::new();
        let observer: Arc<dyn SessionObserver> = Arc::new(Recorder::default());
        multicaster.add(&observer);
        assert_eq!(Arc::strong_count(&observer), 1);

        drop(observer);
        assert!(multicaster.is_empty());
    }

    struct Registrar {
        multicaster: Arc<DelegateMulticaster>,
        late: Arc<dyn SessionObserver>,
    }

    impl SessionObserver for Registrar {
        fn on_event(&self, _event: &SessionEvent) {
            self.multicaster.add(&self.late);
        }
    }

    #[test]
    fn test_mutation_during_emit_applies_to_next_pass() {
        let multicaster = Arc::new(DelegateMulticaster::new());
        let late = Arc::new(Recorder::default());
        let registrar: Arc<dyn SessionObserver> = Arc::new(Registrar {
            multicaster: multicaster.clone(),
            late: late.clone(),
        });
        multicaster.add(&registrar);

        let task = TaskId::next();
        multicaster.emit(&finished(task));
        assert!(late.0.lock().is_empty());

        multicaster.emit(&finished(task));
        assert_eq!(late.0.lock().len(), 1);
    }

    #[test]
    fn test_event_task() {
        let task = TaskId::next();
        let event = SessionEvent::DownloadProgress {
            task,
            received: 10,
            total: None,
        };
        assert_eq!(event.task(), task);
    }
}
