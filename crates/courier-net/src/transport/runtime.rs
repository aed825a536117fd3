//! Runtime management for the reqwest transport.
//!
//! The transport spawns its work on the tokio runtime it was created in, or
//! the one it was given. When it is used from plain threads with no runtime
//! around, a small shared runtime is created on first use.

use std::sync::OnceLock;

use tokio::runtime::{Handle, Runtime};

use courier_core::logging::targets;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Get the shared runtime, creating it if needed.
pub fn get() -> std::io::Result<&'static Runtime> {
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("courier-transport")
        .enable_all()
        .build()?;
    tracing::debug!(target: targets::TRANSPORT, "shared transport runtime started");
    Ok(RUNTIME.get_or_init(|| runtime))
}

/// A handle to the runtime of the calling context, or the shared runtime.
pub fn current_or_shared() -> std::io::Result<Handle> {
    match Handle::try_current() {
        Ok(handle) => Ok(handle),
        Err(_) => get().map(|runtime| runtime.handle().clone()),
    }
}
