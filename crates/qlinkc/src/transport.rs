//! Boundary to the peer-to-peer engine.
//!
//! The engine (ICE/DTLS/SCTP) is consumed through [`PeerSession`]; its
//! events arrive on a channel bundled with it in a [`PeerHandle`].
//! [`Transport`] runs the offer/answer exchange on top of a [`Signaler`].

use crate::error::{ConnectError, TransportError};
use async_trait::async_trait;
use qlink_common::{SessionDescription, Signaler};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Media kind of a remote track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// Audio track.
    Audio,
    /// Video track.
    Video,
}

/// A remote media track announced by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    /// Track kind.
    pub kind: TrackKind,
    /// Engine-assigned track id.
    pub id: String,
}

/// Raw events from the peer engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The data channel opened.
    ChannelOpen,
    /// The data channel closed.
    ChannelClosed,
    /// A text message arrived on the data channel.
    Message(String),
    /// A remote media track arrived.
    Track(TrackInfo),
}

/// Operations the peer engine must offer.
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Creates a local offer.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    /// Applies the local description and returns it as it should be
    /// signaled (engines that gather candidates up front fill them in).
    async fn set_local_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<SessionDescription, TransportError>;
    /// Applies the remote answer.
    async fn set_remote_description(&self, desc: &SessionDescription)
        -> Result<(), TransportError>;
    /// Sends one text message on the data channel. Each call is written whole.
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;
    /// Closes the data channel and the peer connection.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A peer session together with its event stream.
pub struct PeerHandle {
    /// Session operations.
    pub session: Arc<dyn PeerSession>,
    /// Events raised by the session.
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl PeerHandle {
    /// Bundles a session with its event receiver.
    pub fn new(session: Arc<dyn PeerSession>, events: mpsc::UnboundedReceiver<PeerEvent>) -> Self {
        Self { session, events }
    }
}

/// Offer/answer negotiation for one peer session.
#[derive(Clone)]
pub struct Transport {
    peer: Arc<dyn PeerSession>,
    signaler: Arc<dyn Signaler>,
}

impl Transport {
    /// Creates a transport over `peer`, signaling through `signaler`.
    pub fn new(peer: Arc<dyn PeerSession>, signaler: Arc<dyn Signaler>) -> Self {
        Self { peer, signaler }
    }

    /// The underlying peer session.
    pub fn peer(&self) -> &Arc<dyn PeerSession> {
        &self.peer
    }

    /// Creates and applies a local offer, exchanges it for the robot's
    /// answer, and applies that answer. `token`, if any, is merged into the
    /// signaled offer only.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::SessionRejected`] when the robot refuses the
    /// session, [`ConnectError::Handshake`] on signaling failures and
    /// [`ConnectError::Transport`] on peer engine failures.
    pub async fn negotiate(&self, ip: &str, token: Option<&str>) -> Result<(), ConnectError> {
        let offer = self.peer.create_offer().await?;
        let mut signaled = self.peer.set_local_description(&offer).await?;
        debug!(sdp_len = signaled.sdp.len(), "local offer applied");

        signaled.token = token.map(str::to_owned);
        let answer = self.signaler.exchange(ip, &signaled).await?;

        self.peer.set_remote_description(&answer).await?;
        info!(%ip, "remote answer applied");
        Ok(())
    }
}

/// Opens a peer session on the compiled-in engine.
///
/// # Errors
///
/// Returns [`TransportError::Unavailable`] when built without an engine.
#[cfg(feature = "webrtc")]
pub async fn open_default_peer() -> Result<PeerHandle, TransportError> {
    crate::webrtc_peer::WebrtcPeer::open().await
}

/// Opens a peer session on the compiled-in engine.
///
/// # Errors
///
/// Returns [`TransportError::Unavailable`] when built without an engine.
#[cfg(not(feature = "webrtc"))]
pub async fn open_default_peer() -> Result<PeerHandle, TransportError> {
    Err(TransportError::Unavailable)
}
