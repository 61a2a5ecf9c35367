#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::{get, post};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use qlink_common::crypto;
use qlink_common::frame::{Frame, MessageKind, Payload};
use qlink_common::{HandshakeError, SessionDescription, Signaler};
use qlinkc::connection::{Connection, ConnectionOptions, Link};
use qlinkc::error::{ConnectError, TransportError};
use qlinkc::transport::{PeerEvent, PeerHandle, PeerSession};
use rand::rngs::OsRng;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Span;

pub const WAIT: Duration = Duration::from_secs(5);

/// In-memory peer engine: records what the connection sends and lets the
/// test raise engine events.
pub struct FakePeer {
    sent: mpsc::UnboundedSender<String>,
    pub remote: Mutex<Option<SessionDescription>>,
    pub closed: AtomicBool,
}

#[async_trait]
impl PeerSession for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::offer("v=0 fake offer"))
    }

    async fn set_local_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        Ok(desc.clone())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), TransportError> {
        *self.remote.lock().unwrap() = Some(desc.clone());
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.sent
            .send(text.to_owned())
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// The robot's side of a fake peer.
pub struct FakeRobot {
    pub peer: Arc<FakePeer>,
    events: mpsc::UnboundedSender<PeerEvent>,
    sent: mpsc::UnboundedReceiver<String>,
}

impl FakeRobot {
    pub fn open_channel(&self) {
        self.events.send(PeerEvent::ChannelOpen).unwrap();
    }

    pub fn close_channel(&self) {
        let _ = self.events.send(PeerEvent::ChannelClosed);
    }

    pub fn push(&self, text: impl Into<String>) {
        let _ = self.events.send(PeerEvent::Message(text.into()));
    }

    pub fn challenge(&self, challenge: &str) {
        self.push(format!(r#"{{"type":"validation","data":"{challenge}"}}"#));
    }

    pub fn accept(&self) {
        self.challenge("Validation Ok.");
    }

    /// Next raw text written to the data channel.
    pub async fn next_raw(&mut self) -> String {
        tokio::time::timeout(WAIT, self.sent.recv())
            .await
            .expect("timeout waiting for outbound frame")
            .expect("writer stopped")
    }

    /// Next outbound frame that is not a heartbeat.
    pub async fn next_frame(&mut self) -> Frame {
        loop {
            let frame = Frame::parse(&self.next_raw().await).unwrap();
            if frame.kind != MessageKind::Heartbeat {
                return frame;
            }
        }
    }

    /// Exact text of the next outbound frame that is not a heartbeat.
    pub async fn next_raw_frame(&mut self) -> String {
        loop {
            let raw = self.next_raw().await;
            if Frame::parse(&raw).unwrap().kind != MessageKind::Heartbeat {
                return raw;
            }
        }
    }

    pub async fn next_heartbeat(&mut self) -> Frame {
        loop {
            let frame = Frame::parse(&self.next_raw().await).unwrap();
            if frame.kind == MessageKind::Heartbeat {
                return frame;
            }
        }
    }

    /// Returns an outbound frame if one arrives within `wait`.
    pub async fn try_next_frame(&mut self, wait: Duration) -> Option<Frame> {
        tokio::time::timeout(wait, self.next_frame()).await.ok()
    }

    /// Answers a request frame with a response on `topic`.
    pub fn respond(&self, request: &Frame, topic: &str, body: &str) {
        let id = request.correlation_id().expect("request without id");
        self.push(response_text(topic, id, body));
    }
}

pub fn response_text(topic: &str, id: u32, body: &str) -> String {
    format!(
        r#"{{"type":"res","topic":"{topic}","data":{{"header":{{"identity":{{"id":{id},"api_id":1004}},"status":{{"code":0}}}},"data":"{body}"}}}}"#
    )
}

pub fn fake_peer() -> (PeerHandle, FakeRobot) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let peer = Arc::new(FakePeer {
        sent: sent_tx,
        remote: Mutex::new(None),
        closed: AtomicBool::new(false),
    });
    let handle = PeerHandle::new(peer.clone(), events_rx);
    let robot = FakeRobot {
        peer,
        events: events_tx,
        sent: sent_rx,
    };
    (handle, robot)
}

/// Signaler answering from memory.
pub struct StaticSignaler {
    reject: bool,
    pub offers: Mutex<Vec<(String, SessionDescription)>>,
}

impl StaticSignaler {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self {
            reject: false,
            offers: Mutex::new(Vec::new()),
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            reject: true,
            offers: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Signaler for StaticSignaler {
    async fn exchange(
        &self,
        ip: &str,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, HandshakeError> {
        self.offers
            .lock()
            .unwrap()
            .push((ip.to_owned(), offer.clone()));
        if self.reject {
            Err(HandshakeError::SessionRejected)
        } else {
            Ok(SessionDescription::answer("v=0 fake answer"))
        }
    }
}

pub fn test_options() -> ConnectionOptions {
    let mut options = ConnectionOptions::new("127.0.0.1");
    options.heartbeat_period = Duration::from_millis(50);
    options.connect_timeout = WAIT;
    options
}

pub fn new_connection(
    options: ConnectionOptions,
    signaler: Arc<dyn Signaler>,
) -> (Connection, FakeRobot) {
    let (peer, robot) = fake_peer();
    (Connection::new(options, peer, signaler, Span::none()), robot)
}

pub fn spawn_connect(conn: &Connection) -> JoinHandle<Result<(), ConnectError>> {
    let conn = conn.clone();
    tokio::spawn(async move { conn.connect().await })
}

/// A connection that has passed validation. Its first heartbeat is
/// already consumed.
pub async fn connected() -> (Connection, FakeRobot) {
    let (conn, mut robot) = new_connection(test_options(), StaticSignaler::accepting());
    let connecting = spawn_connect(&conn);
    robot.open_channel();
    robot.accept();
    connecting.await.unwrap().unwrap();
    robot.next_heartbeat().await;
    (conn, robot)
}

pub fn text_payload(frame: &Frame) -> Option<&str> {
    frame.data.as_ref().and_then(Payload::as_text)
}

// ── Simulated robot signaling endpoint ──────────────────────────────

pub struct SignalingRobot {
    key: RsaPrivateKey,
    reject: bool,
    pub offers: Mutex<Vec<SessionDescription>>,
}

#[derive(serde::Deserialize)]
struct ConnectBody {
    data1: String,
    data2: String,
}

async fn con_notify(State(robot): State<Arc<SignalingRobot>>) -> String {
    let der = robot.key.to_public_key().to_public_key_der().unwrap();
    // Path ending "xAxBxCxDxE" selects `/con_ing_01234`.
    let blob = format!("0123456789{}xAxBxCxDxE", BASE64.encode(der.as_bytes()));
    BASE64.encode(serde_json::json!({ "data1": blob }).to_string())
}

async fn con_ing(
    State(robot): State<Arc<SignalingRobot>>,
    axum::Json(body): axum::Json<ConnectBody>,
) -> String {
    let wrapped = BASE64.decode(body.data2).unwrap();
    let secret = robot.key.decrypt(Pkcs1v15Encrypt, &wrapped).unwrap();
    let offer = crypto::aes_ecb_decrypt(&secret, &body.data1).unwrap();
    robot
        .offers
        .lock()
        .unwrap()
        .push(serde_json::from_str(&offer).unwrap());
    let sdp = if robot.reject { "reject" } else { "v=0 robot answer" };
    let answer = serde_json::to_string(&SessionDescription::answer(sdp)).unwrap();
    crypto::aes_ecb_encrypt(&secret, answer.as_bytes()).unwrap()
}

/// Serves `/con_notify` and `/con_ing_01234` on an ephemeral port.
pub async fn spawn_signaling_robot(reject: bool) -> (SocketAddr, Arc<SignalingRobot>) {
    let robot = Arc::new(SignalingRobot {
        key: RsaPrivateKey::new(&mut OsRng, 1024).unwrap(),
        reject,
        offers: Mutex::new(Vec::new()),
    });
    let app = axum::Router::new()
        .route("/con_notify", get(con_notify))
        .route("/con_ing_01234", post(con_ing))
        .with_state(robot.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, robot)
}
