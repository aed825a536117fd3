//! Logging facilities for Courier.
//!
//! Courier uses the `tracing` crate for instrumentation and never installs a
//! subscriber itself. To see logs, install one in your application:
//!
//! ```ignore
//! fn main() {
//!     tracing_subscriber::fmt()
//!         .with_env_filter("courier_net=debug,courier_core=info")
//!         .init();
//! }
//! ```

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Core crate target.
    pub const CORE: &str = "courier_core";
    /// Dispatch queue target.
    pub const DISPATCH: &str = "courier_core::dispatch";
    /// Observer set target.
    pub const OBSERVER: &str = "courier_core::observer";
    /// Request engine (manager, builder, response processing) target.
    pub const ENGINE: &str = "courier_net::engine";
    /// Transport target.
    pub const TRANSPORT: &str = "courier_net::transport";
    /// Codec registry target.
    pub const CODEC: &str = "courier_net::codec";
    /// Session delegate and progress tracker target.
    pub const DELEGATE: &str = "courier_net::delegate";
}
