//! Common types shared by the dsync session broker and its clients.
//!
//! This crate provides:
//! - The JSON wire envelope and its parsing rules ([`envelope`])
//! - Peer roles, reserved event names and sentinel message ids ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod types;

pub use envelope::{Envelope, EnvelopeError, MessageId};
pub use types::Role;
