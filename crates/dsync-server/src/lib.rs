//! Session broker pairing one tester with one app per session id and
//! relaying actions between them over WebSocket.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
/// Per-connection message handling and the WebSocket loop.
pub mod connection;
/// Error types for broker operations.
pub mod error;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Session-id keyed registry of live sessions.
pub mod registry;
/// Accept loop and shared server state.
pub mod server;
/// The app/tester pairing record.
pub mod session;

pub use registry::{PeerHandle, SessionRegistry};
pub use server::{run, run_with_shutdown, ServerState};
pub use session::Session;
