//! Robot control-channel client: validated peer session, frame dispatch,
//! request/response correlation and a multi-client broadcast bridge.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Command API: fire-and-forget commands and correlated requests.
pub mod api;
/// WebSocket server sharing one upstream session with many clients.
pub mod bridge;
/// Link to a running bridge over WebSocket.
pub mod bridge_client;
/// CLI parsing and TOML configuration.
pub mod config;
/// Protocol dispatcher: state machine, validation and heartbeats.
pub mod connection;
/// Error types for each layer.
pub mod error;
/// Subscriber and pending-request routing.
pub mod router;
/// Peer engine boundary and offer/answer negotiation.
pub mod transport;
/// `webrtc` crate adapter.
#[cfg(feature = "webrtc")]
pub mod webrtc_peer;
