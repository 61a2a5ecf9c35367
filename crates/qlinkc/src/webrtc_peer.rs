//! [`PeerSession`] on the `webrtc` crate.
//!
//! The robot expects a receive-only video transceiver, a send/receive audio
//! transceiver and one data channel labelled `data`. ICE candidates are
//! gathered before the offer is signaled; the robot does not trickle.

use crate::error::TransportError;
use crate::transport::{PeerEvent, PeerHandle, PeerSession, TrackInfo, TrackKind};
use async_trait::async_trait;
use qlink_common::types::DATA_CHANNEL_LABEL;
use qlink_common::SessionDescription;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

fn engine(e: webrtc::Error) -> TransportError {
    TransportError::Peer(e.to_string())
}

/// A peer connection with the robot's expected media layout.
pub struct WebrtcPeer {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
}

impl WebrtcPeer {
    /// Builds the peer connection and wires its callbacks to a fresh event
    /// channel.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Peer`] if the engine cannot be set up.
    pub async fn open() -> Result<PeerHandle, TransportError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(engine)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .map_err(engine)?,
        );

        for (kind, direction) in [
            (RTPCodecType::Video, RTCRtpTransceiverDirection::Recvonly),
            (RTPCodecType::Audio, RTCRtpTransceiverDirection::Sendrecv),
        ] {
            let init = RTCRtpTransceiverInit {
                direction,
                send_encodings: Vec::new(),
            };
            pc.add_transceiver_from_kind(kind, Some(init))
                .await
                .map_err(engine)?;
        }

        let channel = pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(engine)?;

        let (tx, rx) = mpsc::unbounded_channel();
        wire_events(&pc, &channel, &tx);

        let session = Arc::new(Self { pc, channel });
        Ok(PeerHandle::new(session, rx))
    }
}

fn wire_events(
    pc: &RTCPeerConnection,
    channel: &RTCDataChannel,
    tx: &mpsc::UnboundedSender<PeerEvent>,
) {
    let open = tx.clone();
    channel.on_open(Box::new(move || {
        let _ = open.send(PeerEvent::ChannelOpen);
        Box::pin(async {})
    }));

    let closed = tx.clone();
    channel.on_close(Box::new(move || {
        let _ = closed.send(PeerEvent::ChannelClosed);
        Box::pin(async {})
    }));

    let messages = tx.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        match String::from_utf8(msg.data.to_vec()) {
            Ok(text) => {
                let _ = messages.send(PeerEvent::Message(text));
            }
            Err(_) => warn!(len = msg.data.len(), "ignoring non-UTF-8 data channel message"),
        }
        Box::pin(async {})
    }));

    let tracks = tx.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        };
        if let Some(kind) = kind {
            let _ = tracks.send(PeerEvent::Track(TrackInfo {
                kind,
                id: track.id(),
            }));
        }
        Box::pin(async {})
    }));

    let state = tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        debug!(state = %s, "peer connection state");
        if matches!(
            s,
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
        ) {
            let _ = state.send(PeerEvent::ChannelClosed);
        }
        Box::pin(async {})
    }));
}

#[async_trait]
impl PeerSession for WebrtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(engine)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn set_local_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        let offer = RTCSessionDescription::offer(desc.sdp.clone()).map_err(engine)?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await.map_err(engine)?;
        let _ = gathered.recv().await;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Peer("no local description".into()))?;
        Ok(SessionDescription::offer(local.sdp))
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(desc.sdp.clone()).map_err(engine)?;
        self.pc.set_remote_description(answer).await.map_err(engine)
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.channel
            .send_text(text.to_owned())
            .await
            .map(|_| ())
            .map_err(engine)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "data channel close failed");
        }
        self.pc.close().await.map_err(engine)
    }
}
