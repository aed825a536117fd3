//! Weak observer registries.
//!
//! An [`ObserverSet`] holds non-owning references to observers. Registering
//! an observer never extends its lifetime: once every strong reference is
//! dropped, the entry stops receiving notifications and is pruned on the next
//! emission.
//!
//! Identity is the observer's allocation address, so adding the same
//! `Arc` twice is a no-op and a single removal unregisters it.
//!
//! Emission takes a snapshot of the live observers under the lock and invokes
//! them after releasing it. Observers may therefore add or remove observers
//! (including themselves) from within a notification without deadlocking;
//! such changes take effect from the next emission.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::logging::targets;

/// A thread-safe set of weakly held observers.
pub struct ObserverSet<T: ?Sized> {
    entries: Mutex<Vec<Weak<T>>>,
}

fn identity<T: ?Sized>(ptr: *const T) -> *const () {
    ptr as *const ()
}

impl<T: ?Sized> ObserverSet<T> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer without taking ownership of it.
    ///
    /// Returns `false` if the observer was already registered.
    pub fn add(&self, observer: &Arc<T>) -> bool {
        let id = identity(Arc::as_ptr(observer));
        let mut entries = self.entries.lock();
        if entries
            .iter()
            .any(|entry| identity(entry.as_ptr()) == id && entry.strong_count() > 0)
        {
            return false;
        }
        entries.retain(|entry| entry.strong_count() > 0);
        entries.push(Arc::downgrade(observer));
        tracing::trace!(target: targets::OBSERVER, observer_count = entries.len(), "observer added");
        true
    }

    /// Unregister an observer.
    ///
    /// Returns `false` if it was not registered.
    pub fn remove(&self, observer: &Arc<T>) -> bool {
        let id = identity(Arc::as_ptr(observer));
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| identity(entry.as_ptr()) != id);
        let removed = entries.len() != before;
        if removed {
            tracing::trace!(target: targets::OBSERVER, observer_count = entries.len(), "observer removed");
        }
        removed
    }

    /// Check whether an observer is currently registered.
    pub fn contains(&self, observer: &Arc<T>) -> bool {
        let id = identity(Arc::as_ptr(observer));
        self.entries
            .lock()
            .iter()
            .any(|entry| identity(entry.as_ptr()) == id && entry.strong_count() > 0)
    }

    /// Number of registered observers that are still alive.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    /// Check if no live observers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upgrade every live observer, pruning dead entries.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        let mut entries = self.entries.lock();
        let mut live = Vec::with_capacity(entries.len());
        entries.retain(|entry| match entry.upgrade() {
            Some(observer) => {
                live.push(observer);
                true
            }
            None => false,
        });
        live
    }

    /// Invoke `f` for each live observer, outside the lock.
    pub fn emit(&self, mut f: impl FnMut(&Arc<T>)) {
        let observers = self.snapshot();
        tracing::trace!(target: targets::OBSERVER, observer_count = observers.len(), "emitting to observers");
        for observer in &observers {
            f(observer);
        }
    }

    /// Unregister all observers.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl<T: ?Sized> Default for ObserverSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> std::fmt::Debug for ObserverSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet")
            .field("observers", &self.len())
            .finish()
    }
}
