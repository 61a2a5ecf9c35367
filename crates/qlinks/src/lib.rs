//! qlink signaling proxy: runs the robot's local handshake for remote peers.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
/// Error types for the proxy server and its endpoint.
pub mod error;
/// HTTP routes and shared server state.
pub mod server;

pub use server::{run, run_with_shutdown, ServerState};
