//! Tester-side synchronization client: a correlated request/response layer
//! over one WebSocket, the action catalogue, and the readiness state machine.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Closed catalogue of actions and their reply handling.
pub mod action;
/// Readiness tracking, stall watchdog and the action API.
pub mod client;
/// CLI parsing and TOML configuration.
pub mod config;
/// WebSocket wrapper correlating replies to requests by message id.
pub mod socket;

pub use action::{Action, ClientError};
pub use client::Client;
pub use config::ClientConfig;
pub use socket::{CorrelatedSocket, SocketError};
