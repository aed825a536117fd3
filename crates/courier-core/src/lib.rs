//! Core systems for Courier.
//!
//! This crate provides the execution primitives the request engine is built on:
//!
//! - **Dispatch Contexts**: A single, fixed context on which every outward
//!   callback is delivered ([`SerialQueue`], [`PumpedQueue`])
//! - **Observer Sets**: Weak, identity-keyed observer registries with
//!   snapshot-based emission ([`ObserverSet`])
//! - **Logging**: `tracing` targets for filtering by subsystem
//!
//! # Dispatch Example
//!
//! ```
//! use courier_core::{DispatchContext, PumpedQueue};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let queue = PumpedQueue::new();
//! let hits = Arc::new(AtomicUsize::new(0));
//!
//! let hits_clone = hits.clone();
//! queue.dispatch(Box::new(move || {
//!     hits_clone.fetch_add(1, Ordering::SeqCst);
//! }));
//!
//! // Nothing runs until the owning context pumps the queue.
//! assert_eq!(hits.load(Ordering::SeqCst), 0);
//! queue.process_pending();
//! assert_eq!(hits.load(Ordering::SeqCst), 1);
//! ```
//!
//! # Observer Example
//!
//! ```
//! use courier_core::ObserverSet;
//! use std::sync::Arc;
//!
//! trait Listener: Send + Sync {
//!     fn notify(&self, value: u32);
//! }
//!
//! struct Printer;
//! impl Listener for Printer {
//!     fn notify(&self, value: u32) {
//!         println!("got {value}");
//!     }
//! }
//!
//! let set: ObserverSet<dyn Listener> = ObserverSet::new();
//! let printer: Arc<dyn Listener> = Arc::new(Printer);
//!
//! set.add(&printer);
//! set.add(&printer); // same identity, still one registration
//! assert_eq!(set.len(), 1);
//!
//! set.emit(|listener| listener.notify(7));
//! ```

pub mod dispatch;
mod error;
pub mod logging;
pub mod observer;

pub use dispatch::{DispatchContext, Job, PumpedQueue, SerialQueue, SerialQueueConfig};
pub use error::{CoreError, Result};
pub use observer::ObserverSet;
