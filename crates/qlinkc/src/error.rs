use crate::connection::ConnectionState;
use qlink_common::{FrameError, HandshakeError};
use std::time::Duration;
use thiserror::Error;

/// Failures reported by a peer session.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer engine reported an error.
    #[error("peer engine error: {0}")]
    Peer(String),
    /// The data channel is not open.
    #[error("data channel is not open")]
    ChannelClosed,
    /// No peer engine is compiled into this build.
    #[error("no peer transport available (build with the `webrtc` feature)")]
    Unavailable,
}

/// Failures that abort a connect attempt.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Signaling failed.
    #[error("handshake failed: {0}")]
    Handshake(#[source] HandshakeError),
    /// The robot already has an active peer.
    #[error("session rejected by robot (another peer is connected)")]
    SessionRejected,
    /// The peer engine failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// `connect` was called on a link that is not idle.
    #[error("connect already attempted (state: {0:?})")]
    AlreadyStarted(ConnectionState),
    /// The robot kept sending challenges past the configured cap.
    #[error("validation not accepted after {0} attempts")]
    ValidationExhausted(u32),
    /// The session was not validated before the deadline.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    /// The channel closed before the session was validated.
    #[error("disconnected before the session was ready")]
    Disconnected,
    /// The bridge WebSocket could not be opened.
    #[error("bridge connection failed: {0}")]
    Bridge(String),
}

impl From<HandshakeError> for ConnectError {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::SessionRejected => Self::SessionRejected,
            other => Self::Handshake(other),
        }
    }
}

/// Failures when queueing an outbound frame.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    /// The link is not in a state that accepts frames.
    #[error("link not open (state: {0:?})")]
    NotOpen(ConnectionState),
    /// The writer task has stopped.
    #[error("link closed")]
    Closed,
    /// The frame could not be encoded.
    #[error("frame encode failed: {0}")]
    Encode(String),
    /// Raw text handed to [`Link::send_raw`](crate::connection::Link::send_raw)
    /// is not a frame.
    #[error("not a frame: {0}")]
    Malformed(String),
}

impl From<FrameError> for SendError {
    fn from(e: FrameError) -> Self {
        Self::Encode(e.to_string())
    }
}

/// Failures of a single request/response call.
///
/// Only the affected request fails; the connection stays usable.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// No correlated response arrived in time.
    #[error("request {id} timed out after {after:?}")]
    Timeout {
        /// Correlation id of the request.
        id: u32,
        /// Configured window.
        after: Duration,
    },
    /// The link closed while the request was outstanding.
    #[error("disconnected while waiting for response")]
    Disconnected,
    /// Another request is already waiting on the same correlation key.
    #[error("correlation id {0} already has a pending request")]
    IdInUse(u32),
    /// The request frame could not be sent.
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Failures of the broadcast bridge server.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The listen socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Accepting a client failed.
    #[error("accept failed: {0}")]
    Accept(#[from] std::io::Error),
    /// The upstream connection could not be built.
    #[error("upstream unavailable: {0}")]
    Upstream(#[from] TransportError),
}
