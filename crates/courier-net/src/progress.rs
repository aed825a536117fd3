//! Transfer progress reporting.

use std::fmt;
use std::sync::Arc;

use courier_core::DispatchContext;
use courier_core::logging::targets;

use crate::delegate::{SessionEvent, SessionObserver};
use crate::task::TaskId;

/// Direction of a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    /// Sending a body.
    Upload,
    /// Receiving a body.
    Download,
}

/// Progress of one transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    /// The task being reported on.
    pub task: TaskId,
    /// Upload or download.
    pub direction: TransferDirection,
    /// Number of bytes transferred so far.
    pub bytes_transferred: u64,
    /// Total number of bytes, if known.
    pub total_bytes: Option<u64>,
}

impl TransferProgress {
    /// Get the progress as a fraction (0.0 to 1.0), if total is known.
    pub fn fraction(&self) -> Option<f64> {
        self.total_bytes.map(|total| {
            if total == 0 {
                1.0
            } else {
                (self.bytes_transferred as f64 / total as f64).min(1.0)
            }
        })
    }

    /// Get the progress as a percentage (0 to 100), if total is known.
    pub fn percent(&self) -> Option<u8> {
        self.fraction().map(|f| (f * 100.0) as u8)
    }

    /// Check if every expected byte has been transferred.
    pub fn is_complete(&self) -> bool {
        self.total_bytes
            .is_some_and(|total| self.bytes_transferred >= total)
    }
}

/// Caller-supplied progress handler.
pub type ProgressHandler = Arc<dyn Fn(TransferProgress) + Send + Sync + 'static>;

/// Forwards one task's progress events to a handler on a dispatch context.
///
/// Events for other tasks or the other direction are ignored. Progress is
/// re-dispatched in the order the transport reported it.
pub struct ProgressTracker {
    task: TaskId,
    direction: TransferDirection,
    handler: ProgressHandler,
    dispatcher: Arc<dyn DispatchContext>,
}

impl ProgressTracker {
    /// Create a tracker for one task and direction.
    pub fn new(
        task: TaskId,
        direction: TransferDirection,
        handler: ProgressHandler,
        dispatcher: Arc<dyn DispatchContext>,
    ) -> Self {
        Self {
            task,
            direction,
            handler,
            dispatcher,
        }
    }

    /// The tracked task.
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// The tracked direction.
    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    fn progress_for(&self, event: &SessionEvent) -> Option<TransferProgress> {
        let (task, bytes_transferred, total_bytes) = match (self.direction, event) {
            (TransferDirection::Upload, SessionEvent::UploadProgress { task, sent, total }) => {
                (*task, *sent, *total)
            }
            (
                TransferDirection::Download,
                SessionEvent::DownloadProgress {
                    task,
                    received,
                    total,
                },
            ) => (*task, *received, *total),
            _ => return None,
        };
        (task == self.task).then_some(TransferProgress {
            task,
            direction: self.direction,
            bytes_transferred,
            total_bytes,
        })
    }
}

impl SessionObserver for ProgressTracker {
    fn on_event(&self, event: &SessionEvent) {
        let Some(progress) = self.progress_for(event) else {
            return;
        };
        tracing::trace!(
            target: targets::DELEGATE,
            task = %self.task,
            bytes = progress.bytes_transferred,
            total = ?progress.total_bytes,
            "progress"
        );
        let handler = self.handler.clone();
        self.dispatcher.dispatch(Box::new(move || handler(progress)));
    }
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("task", &self.task)
            .field("direction", &self.direction)
            .finish()
    }
}
