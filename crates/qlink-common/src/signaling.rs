//! Signaling: turning a local session offer into the robot's answer.
//!
//! [`LocalSignaler`] speaks the robot's own two-phase HTTP handshake.
//! [`RemoteSignaler`] hands the offer to a signaling proxy that performs
//! the same handshake from inside the robot's network.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::{self, CryptoError, SessionSecret};
use crate::types::{SDP_REJECT, SIGNALING_PORT};

/// Default per-request HTTP timeout for signaling calls.
pub const DEFAULT_SIGNALING_TIMEOUT: Duration = Duration::from_secs(10);

/// An SDP offer or answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// `"offer"` or `"answer"`.
    #[serde(rename = "type", default)]
    pub sdp_type: String,
    /// SDP body, or the literal `"reject"` when the robot refuses.
    pub sdp: String,
    /// Opaque authentication token merged into the offer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl SessionDescription {
    /// Creates an offer.
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "offer".to_string(),
            sdp: sdp.into(),
            token: None,
        }
    }

    /// Creates an answer.
    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "answer".to_string(),
            sdp: sdp.into(),
            token: None,
        }
    }

    /// Returns `true` if this is the robot's rejection of a second peer.
    #[must_use]
    pub fn is_reject(&self) -> bool {
        self.sdp == SDP_REJECT
    }
}

/// Handshake failures. All are fatal to the current connect attempt.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// A signaling call returned a non-success status.
    #[error("signaling phase {phase} returned HTTP {status}")]
    Http {
        /// 1 for the notify call, 2 for the connect call.
        phase: u8,
        /// HTTP status code.
        status: u16,
    },
    /// A signaling call failed before a status was received.
    #[error("signaling phase {phase} request failed: {source}")]
    Request {
        /// 1 for the notify call, 2 for the connect call.
        phase: u8,
        /// Underlying HTTP error.
        #[source]
        source: reqwest::Error,
    },
    /// The notify body was not base64 JSON with a `data1` field.
    #[error("malformed notify response: {0}")]
    MalformedNotify(String),
    /// The offer could not be encoded.
    #[error("offer could not be encoded: {0}")]
    MalformedOffer(String),
    /// The answer was not a session description.
    #[error("malformed answer: {0}")]
    MalformedAnswer(String),
    /// Key material or ciphertext was unusable.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// The robot already has an active peer.
    #[error("session rejected by robot (another peer is connected)")]
    SessionRejected,
}

/// Exchanges a local offer for the robot's answer.
#[async_trait]
pub trait Signaler: Send + Sync {
    /// Performs the exchange for the robot at `ip`.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::SessionRejected`] if the robot refuses the
    /// session, and other variants for transport or decoding failures.
    async fn exchange(
        &self,
        ip: &str,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, HandshakeError>;
}

#[derive(Deserialize)]
struct NotifyBody {
    data1: String,
}

#[derive(Serialize)]
struct ConnectBody {
    data1: String,
    data2: String,
}

/// Decodes the body of `GET /con_notify`: base64 of `{"data1": blob}`.
///
/// # Errors
///
/// Returns [`HandshakeError::MalformedNotify`] on bad base64 or JSON.
pub fn decode_notify(body: &str) -> Result<String, HandshakeError> {
    let raw = STANDARD
        .decode(body.trim())
        .map_err(|e| HandshakeError::MalformedNotify(e.to_string()))?;
    let notify: NotifyBody =
        serde_json::from_slice(&raw).map_err(|e| HandshakeError::MalformedNotify(e.to_string()))?;
    Ok(notify.data1)
}

/// The robot's own HTTP signaling endpoint.
#[derive(Clone)]
pub struct LocalSignaler {
    http: Client,
    port: u16,
    timeout: Duration,
}

impl Default for LocalSignaler {
    fn default() -> Self {
        Self::new(SIGNALING_PORT)
    }
}

impl LocalSignaler {
    /// Creates a signaler targeting `port` on the robot.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            http: Client::new(),
            port,
            timeout: DEFAULT_SIGNALING_TIMEOUT,
        }
    }

    /// Overrides the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn notify(&self, base: &str) -> Result<String, HandshakeError> {
        let url = format!("{base}/con_notify");
        info!(%url, "initiating handshake");
        let resp = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| HandshakeError::Request { phase: 1, source })?;
        let status = resp.status();
        if !status.is_success() {
            warn!(status = %status, "notify request failed");
            return Err(HandshakeError::Http {
                phase: 1,
                status: status.as_u16(),
            });
        }
        let body = resp
            .text()
            .await
            .map_err(|source| HandshakeError::Request { phase: 1, source })?;
        decode_notify(&body)
    }
}

#[async_trait]
impl Signaler for LocalSignaler {
    async fn exchange(
        &self,
        ip: &str,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, HandshakeError> {
        let base = format!("http://{ip}:{}", self.port);
        let blob = self.notify(&base).await?;
        let (key_body, path_ending) = crypto::split_notify_blob(&blob)?;
        debug!(path_ending = %path_ending, "notify blob decoded");

        let secret = SessionSecret::generate();
        let offer_json =
            serde_json::to_string(offer).map_err(|e| HandshakeError::MalformedOffer(e.to_string()))?;
        let body = ConnectBody {
            data1: crypto::aes_ecb_encrypt(secret.key(), offer_json.as_bytes())?,
            data2: crypto::rsa_encrypt(key_body, secret.as_str().as_bytes())?,
        };

        let url = format!("{base}/con_ing_{path_ending}");
        debug!(%url, "sending encrypted offer");
        let resp = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|source| HandshakeError::Request { phase: 2, source })?;
        let status = resp.status();
        if !status.is_success() {
            warn!(status = %status, "connect request failed");
            return Err(HandshakeError::Http {
                phase: 2,
                status: status.as_u16(),
            });
        }
        let ciphertext = resp
            .text()
            .await
            .map_err(|source| HandshakeError::Request { phase: 2, source })?;

        let plaintext = crypto::aes_ecb_decrypt(secret.key(), &ciphertext)?;
        let answer: SessionDescription = serde_json::from_str(&plaintext)
            .map_err(|e| HandshakeError::MalformedAnswer(e.to_string()))?;
        if answer.is_reject() {
            warn!("robot rejected the session; is another peer already connected?");
            return Err(HandshakeError::SessionRejected);
        }
        info!("handshake complete");
        Ok(answer)
    }
}

#[derive(Serialize)]
struct ProxyRequest<'a> {
    ip: &'a str,
    sdp: &'a SessionDescription,
}

/// Status a signaling proxy uses to report [`HandshakeError::SessionRejected`].
pub const PROXY_REJECT_STATUS: u16 = 409;

/// A signaling proxy reachable over HTTP (`POST {ip, sdp}`).
#[derive(Clone)]
pub struct RemoteSignaler {
    http: Client,
    url: String,
    timeout: Duration,
}

impl RemoteSignaler {
    /// Creates a signaler posting to `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            url: url.into(),
            timeout: DEFAULT_SIGNALING_TIMEOUT,
        }
    }

    /// Overrides the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Signaler for RemoteSignaler {
    async fn exchange(
        &self,
        ip: &str,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, HandshakeError> {
        debug!(url = %self.url, %ip, "sending offer to signaling proxy");
        let resp = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&ProxyRequest { ip, sdp: offer })
            .send()
            .await
            .map_err(|source| HandshakeError::Request { phase: 1, source })?;
        let status = resp.status();
        if status.as_u16() == PROXY_REJECT_STATUS {
            return Err(HandshakeError::SessionRejected);
        }
        if !status.is_success() {
            return Err(HandshakeError::Http {
                phase: 1,
                status: status.as_u16(),
            });
        }
        let answer: SessionDescription = resp
            .json()
            .await
            .map_err(|e| HandshakeError::MalformedAnswer(e.to_string()))?;
        if answer.is_reject() {
            return Err(HandshakeError::SessionRejected);
        }
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use rand::rngs::OsRng;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    struct Robot {
        key: RsaPrivateKey,
        reject: bool,
        seen_offer: Mutex<Option<SessionDescription>>,
    }

    #[derive(Deserialize)]
    struct Body {
        data1: String,
        data2: String,
    }

    async fn notify(State(robot): State<Arc<Robot>>) -> String {
        let der = robot.key.to_public_key().to_public_key_der().unwrap();
        let blob = format!("abcdefghij{}xAxBxCxDxE", STANDARD.encode(der.as_bytes()));
        STANDARD.encode(serde_json::json!({ "data1": blob }).to_string())
    }

    async fn connect(State(robot): State<Arc<Robot>>, Json(body): Json<Body>) -> String {
        let wrapped = STANDARD.decode(body.data2).unwrap();
        let secret = robot.key.decrypt(Pkcs1v15Encrypt, &wrapped).unwrap();
        let offer = crypto::aes_ecb_decrypt(&secret, &body.data1).unwrap();
        *robot.seen_offer.lock().unwrap() = serde_json::from_str(&offer).ok();
        let sdp = if robot.reject { SDP_REJECT } else { "v=0 answer" };
        let answer = serde_json::to_string(&SessionDescription::answer(sdp)).unwrap();
        crypto::aes_ecb_encrypt(&secret, answer.as_bytes()).unwrap()
    }

    async fn spawn_robot(reject: bool) -> (SocketAddr, Arc<Robot>) {
        let robot = Arc::new(Robot {
            key: RsaPrivateKey::new(&mut OsRng, 1024).unwrap(),
            reject,
            seen_offer: Mutex::new(None),
        });
        let app = Router::new()
            .route("/con_notify", get(notify))
            .route("/con_ing_01234", post(connect))
            .with_state(robot.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, robot)
    }

    #[test]
    fn decode_notify_reads_data1() {
        let body = STANDARD.encode(r#"{"data1":"hello"}"#);
        assert_eq!(decode_notify(&body).unwrap(), "hello");
        assert!(matches!(
            decode_notify("!!!"),
            Err(HandshakeError::MalformedNotify(_))
        ));
        assert!(matches!(
            decode_notify(&STANDARD.encode("[]")),
            Err(HandshakeError::MalformedNotify(_))
        ));
    }

    #[test]
    fn offer_serializes_token_only_when_present() {
        let mut offer = SessionDescription::offer("v=0");
        assert_eq!(
            serde_json::to_string(&offer).unwrap(),
            r#"{"type":"offer","sdp":"v=0"}"#
        );
        offer.token = Some("tok".into());
        assert!(serde_json::to_string(&offer).unwrap().ends_with(r#""token":"tok"}"#));
    }

    #[tokio::test]
    async fn local_handshake_returns_answer() {
        let (addr, robot) = spawn_robot(false).await;
        let mut offer = SessionDescription::offer("v=0 offer");
        offer.token = Some("secret-token".into());

        let answer = LocalSignaler::new(addr.port())
            .exchange("127.0.0.1", &offer)
            .await
            .unwrap();
        assert_eq!(answer.sdp_type, "answer");
        assert_eq!(answer.sdp, "v=0 answer");
        assert_eq!(robot.seen_offer.lock().unwrap().as_ref(), Some(&offer));
    }

    #[tokio::test]
    async fn local_handshake_surfaces_rejection() {
        let (addr, _robot) = spawn_robot(true).await;
        let err = LocalSignaler::new(addr.port())
            .exchange("127.0.0.1", &SessionDescription::offer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::SessionRejected));
    }

    #[tokio::test]
    async fn phase_one_http_error_is_reported() {
        let app = Router::new().route(
            "/con_notify",
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "busy") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let err = LocalSignaler::new(port)
            .exchange("127.0.0.1", &SessionDescription::offer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Http { phase: 1, status: 503 }));
    }

    #[tokio::test]
    async fn phase_two_http_error_is_reported() {
        // No connect route is served, so phase 2 gets a 404.
        let robot_key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let der = robot_key.to_public_key().to_public_key_der().unwrap();
        let blob = format!("abcdefghij{}xJxJxJxJxJ", STANDARD.encode(der.as_bytes()));
        let notify_body = STANDARD.encode(serde_json::json!({ "data1": blob }).to_string());
        let app = Router::new().route(
            "/con_notify",
            get(move || {
                let body = notify_body.clone();
                async move { body }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let err = LocalSignaler::new(port)
            .exchange("127.0.0.1", &SessionDescription::offer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Http { phase: 2, status: 404 }));
    }

    #[tokio::test]
    async fn unreachable_robot_is_a_request_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = LocalSignaler::new(port)
            .with_timeout(Duration::from_secs(2))
            .exchange("127.0.0.1", &SessionDescription::offer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Request { phase: 1, .. }));
    }

    #[tokio::test]
    async fn remote_signaler_posts_ip_and_offer() {
        let app = Router::new().route(
            "/signal",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["ip"], "10.0.0.7");
                assert_eq!(body["sdp"]["type"], "offer");
                Json(SessionDescription::answer("proxied"))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let answer = RemoteSignaler::new(format!("http://{addr}/signal"))
            .exchange("10.0.0.7", &SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert_eq!(answer.sdp, "proxied");
    }

    #[tokio::test]
    async fn remote_signaler_maps_conflict_to_rejection() {
        let app = Router::new().route(
            "/signal",
            post(|| async { (axum::http::StatusCode::CONFLICT, "rejected") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let err = RemoteSignaler::new(format!("http://{addr}/signal"))
            .exchange("10.0.0.7", &SessionDescription::offer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::SessionRejected));
    }
}
