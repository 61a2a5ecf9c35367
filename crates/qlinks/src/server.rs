use crate::config::ServerConfig;
use crate::error::{QlinksError, SignalError};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use qlink_common::signaling::LocalSignaler;
use qlink_common::{SessionDescription, Signaler};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, info_span, warn, Instrument};

/// Shared state for the proxy server.
pub struct ServerState {
    /// Performs the handshake against the robot.
    pub signaler: Arc<dyn Signaler>,
    /// Runtime server configuration.
    pub config: ServerConfig,
}

impl ServerState {
    /// State that signals robots on the configured local port.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let signaler =
            LocalSignaler::new(config.signaling_port).with_timeout(config.signaling_timeout);
        Self::with_signaler(config, Arc::new(signaler))
    }

    /// State with a caller-supplied signaler.
    #[must_use]
    pub fn with_signaler(config: ServerConfig, signaler: Arc<dyn Signaler>) -> Self {
        Self { signaler, config }
    }
}

/// Body of `POST /signal`.
#[derive(Debug, Deserialize, Serialize)]
pub struct SignalRequest {
    /// Robot address on the proxy's network.
    pub ip: String,
    /// The caller's offer.
    pub sdp: SessionDescription,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Builds the HTTP routes served by the proxy.
pub fn app(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/signal", post(signal_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// # Errors
///
/// Returns an error if the listener fails.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), QlinksError> {
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Serves the proxy until the shutdown channel is signalled or its sender
/// is dropped.
///
/// In-flight handshakes are allowed to finish before this returns.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: tokio::sync::watch::Receiver<()>,
) -> Result<(), QlinksError> {
    let local_addr = listener.local_addr()?;
    info!("signaling proxy listening on {}", local_addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            info!("shutting down signaling proxy");
        })
        .await?;
    Ok(())
}

async fn signal_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<SignalRequest>,
) -> Result<Json<SessionDescription>, SignalError> {
    let ip: IpAddr = request
        .ip
        .parse()
        .map_err(|_| SignalError::InvalidAddress(request.ip.clone()))?;
    if !state.config.allows(ip) {
        warn!(%ip, "robot address not in allow-list");
        return Err(SignalError::Forbidden(ip));
    }

    let span = info_span!("signal", %ip);
    let answer = state
        .signaler
        .exchange(&ip.to_string(), &request.sdp)
        .instrument(span)
        .await
        .map_err(|e| {
            warn!(%ip, error = %e, "handshake failed");
            SignalError::from(e)
        })?;
    if answer.is_reject() {
        return Err(SignalError::Rejected);
    }
    info!(%ip, "answer relayed");
    Ok(Json(answer))
}

/// Health check handler - returns 200 if server is running.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}
