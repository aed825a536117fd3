//! Error types for Courier core.

use thiserror::Error;

/// Errors raised by the core execution primitives.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The dispatch thread could not be started.
    #[error("failed to spawn dispatch thread '{name}': {source}")]
    Spawn {
        /// Name of the thread that failed to start.
        name: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// A specialized Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
