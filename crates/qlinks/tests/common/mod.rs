#![allow(dead_code)]

use axum::extract::State;
use axum::routing::{get, post};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use qlink_common::crypto;
use qlink_common::SessionDescription;
use qlinks::config::ServerConfig;
use qlinks::server::ServerState;
use rand::rngs::OsRng;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

pub fn test_config(signaling_port: u16) -> ServerConfig {
    ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        signaling_port,
        signaling_timeout: Duration::from_secs(5),
        allow: Vec::new(),
    }
}

/// Serves the proxy on an ephemeral port and returns its `/signal` URL.
pub async fn start_proxy(config: ServerConfig) -> String {
    let listener = TcpListener::bind(config.listen).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState::new(config));
    tokio::spawn(async move {
        let _ = qlinks::run(listener, state).await;
    });
    format!("http://{addr}")
}

/// A port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

// ── Simulated robot signaling endpoint ──────────────────────────────

pub struct Robot {
    key: RsaPrivateKey,
    reject: bool,
    pub offers: Mutex<Vec<SessionDescription>>,
}

#[derive(serde::Deserialize)]
struct ConnectBody {
    data1: String,
    data2: String,
}

async fn con_notify(State(robot): State<Arc<Robot>>) -> String {
    let der = robot.key.to_public_key().to_public_key_der().unwrap();
    // Path ending "xAxBxCxDxE" selects `/con_ing_01234`.
    let blob = format!("0123456789{}xAxBxCxDxE", BASE64.encode(der.as_bytes()));
    BASE64.encode(serde_json::json!({ "data1": blob }).to_string())
}

async fn con_ing(State(robot): State<Arc<Robot>>, axum::Json(body): axum::Json<ConnectBody>) -> String {
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

/// Serves the robot's handshake endpoints on an ephemeral port.
pub async fn spawn_robot(reject: bool) -> (SocketAddr, Arc<Robot>) {
    let robot = Arc::new(Robot {
        key: RsaPrivateKey::new(&mut OsRng, 1024).unwrap(),
        reject,
        offers: Mutex::new(Vec::new()),
    });
    let app = axum::Router::new()
        .route("/con_notify", get(con_notify))
        .route("/con_ing_01234", post(con_ing))
        .with_state(robot.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, robot)
}
