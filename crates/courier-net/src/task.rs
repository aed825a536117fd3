//! Task handles for in-flight operations.
//!
//! Every submitted request is tracked by a [`TaskHandle`]. A handle moves
//! from `Active` to exactly one terminal state through an atomic
//! compare-and-swap, which is what guarantees a single delivery per request:
//! whichever of completion or cancellation wins the swap delivers, the other
//! does nothing.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;

use courier_core::logging::targets;

/// Unique identifier for a submitted operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Allocate the next process-unique id.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// The operation is in flight.
    Active = 0,
    /// The operation finished successfully.
    Completed = 1,
    /// The operation was cancelled.
    Cancelled = 2,
    /// The operation finished with an error.
    Failed = 3,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Completed,
            2 => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(self) -> bool {
        self != Self::Active
    }
}

/// Something that can make a best-effort attempt to stop an operation.
///
/// Transports return one of these for every submission.
pub trait Cancelable: Send + Sync {
    /// Request cancellation. Must be safe to call after completion.
    fn cancel(&self);
}

type CancelHook = Box<dyn FnOnce() + Send + 'static>;

struct TaskCore {
    id: TaskId,
    state: AtomicU8,
    cancelable: Mutex<Option<Box<dyn Cancelable>>>,
    on_cancel: Mutex<Option<CancelHook>>,
}

/// A handle to one in-flight operation.
///
/// Clones share state. Cancelling after the task reached a terminal state is
/// a no-op and never triggers a second delivery.
#[derive(Clone)]
pub struct TaskHandle {
    core: Arc<TaskCore>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId) -> Self {
        Self {
            core: Arc::new(TaskCore {
                id,
                state: AtomicU8::new(TaskState::Active as u8),
                cancelable: Mutex::new(None),
                on_cancel: Mutex::new(None),
            }),
        }
    }

    /// The task's id.
    pub fn id(&self) -> TaskId {
        self.core.id
    }

    /// The current state.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.core.state.load(Ordering::Acquire))
    }

    /// Check if the task is still in flight.
    pub fn is_active(&self) -> bool {
        self.state() == TaskState::Active
    }

    /// Cancel the task.
    ///
    /// Returns `true` if this call moved the task to `Cancelled`, `false` if
    /// it had already reached a terminal state.
    pub fn cancel(&self) -> bool {
        if !self.transition(TaskState::Cancelled) {
            tracing::trace!(target: targets::ENGINE, task = %self.id(), "cancel ignored, task already finished");
            return false;
        }
        tracing::debug!(target: targets::ENGINE, task = %self.id(), "task cancelled");

        let cancelable = self.core.cancelable.lock().take();
        if let Some(cancelable) = cancelable {
            cancelable.cancel();
        }
        let hook = self.core.on_cancel.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        true
    }

    /// Move the task to a terminal state on completion.
    ///
    /// Returns `true` if this call won the transition.
    pub(crate) fn finish(&self, state: TaskState) -> bool {
        if !self.transition(state) {
            return false;
        }
        self.core.cancelable.lock().take();
        self.core.on_cancel.lock().take();
        true
    }

    /// Attach the transport's cancelable once submission returned it.
    pub(crate) fn attach(&self, cancelable: Box<dyn Cancelable>) {
        let mut slot = self.core.cancelable.lock();
        match self.state() {
            TaskState::Active => *slot = Some(cancelable),
            TaskState::Cancelled => {
                drop(slot);
                cancelable.cancel();
            }
            TaskState::Completed | TaskState::Failed => {}
        }
    }

    /// Install the hook run when [`cancel`](Self::cancel) wins.
    pub(crate) fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        *self.core.on_cancel.lock() = Some(Box::new(hook));
    }

    fn transition(&self, to: TaskState) -> bool {
        self.core
            .state
            .compare_exchange(
                TaskState::Active as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Cancelable for TaskHandle {
    fn cancel(&self) {
        TaskHandle::cancel(self);
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

static_assertions::assert_impl_all!(TaskHandle: Send, Sync);
