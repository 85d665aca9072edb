//! Signaling relay: broadcasts every WebSocket message to all other peers.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Fan-out of one message to every other registered connection.
pub mod broadcast;
/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for relay operations.
pub mod error;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Opaque message type carried by the relay.
pub mod payload;
/// Concurrent set of open connections.
pub mod registry;
/// Accept loop and shared server state.
pub mod server;

pub use server::{run, run_with_shutdown, ServerState};
