//! sigrelay: WebSocket signaling relay for peer-to-peer connection setup.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for relay sessions.
pub mod error;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
pub mod presence;
/// Id ↔ connection registry and connection handles.
pub mod registry;
/// Envelope forwarding between registered peers.
pub mod router;
/// Accept loop and shared server state.
pub mod server;
pub mod session;
mod throttle;

pub use server::{run, run_with_shutdown, ServerState};
