//! [`Link`] over a WebSocket to a running [`Bridge`](crate::bridge::Bridge).
//!
//! The bridge has already validated the upstream session, so the client
//! goes straight from `Handshaking` to `Connected` once the socket opens.
//! Frames from the bridge are routed locally; requests correlate on this
//! side of the socket.

use crate::connection::{ConnectionState, Link, LinkEvent};
use crate::error::{ConnectError, SendError};
use crate::router::{Inbound, Router};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use qlink_common::Frame;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn, Instrument, Span};

struct Inner {
    url: String,
    router: Router,
    state: watch::Sender<ConnectionState>,
    lifecycle: broadcast::Sender<LinkEvent>,
    outbox: mpsc::UnboundedSender<String>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    shutdown: watch::Sender<bool>,
    span: Span,
}

impl Inner {
    fn advance(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|s| {
            if next > *s {
                *s = next;
                true
            } else {
                false
            }
        })
    }

    fn finish(&self) {
        if self.advance(ConnectionState::Disconnected) {
            info!(url = %self.url, "bridge connection closed");
            self.router.close();
            let _ = self.lifecycle.send(LinkEvent::Disconnected);
            self.shutdown.send_replace(true);
        }
    }
}

/// A client of a broadcast bridge.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<Inner>,
}

impl BridgeClient {
    /// Creates an idle client for the bridge at `url` (`ws://host:port`).
    pub fn new(url: impl Into<String>, span: Span) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (lifecycle, _) = broadcast::channel(16);
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                router: Router::new(),
                state,
                lifecycle,
                outbox,
                outbox_rx: Mutex::new(Some(outbox_rx)),
                shutdown,
                span,
            }),
        }
    }

    /// Bridge URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    async fn open(&self) -> Result<(), ConnectError> {
        let inner = &self.inner;
        let started = inner.state.send_if_modified(|s| {
            if *s == ConnectionState::Idle {
                *s = ConnectionState::Handshaking;
                true
            } else {
                false
            }
        });
        let outbox = inner
            .outbox_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let (true, Some(outbox)) = (started, outbox) else {
            return Err(ConnectError::AlreadyStarted(*inner.state.borrow()));
        };

        let ws = match tokio_tungstenite::connect_async(inner.url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                warn!(url = %inner.url, error = %e, "bridge unreachable");
                inner.finish();
                return Err(ConnectError::Bridge(e.to_string()));
            }
        };

        if !inner.advance(ConnectionState::Connected) {
            // Closed while the socket was opening.
            return Err(ConnectError::Disconnected);
        }
        info!(url = %inner.url, "connected to bridge");
        let _ = inner.lifecycle.send(LinkEvent::Connected);

        let session = session(Arc::clone(inner), ws, outbox);
        tokio::spawn(session.instrument(inner.span.clone()));
        Ok(())
    }
}

type BridgeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn session(
    inner: Arc<Inner>,
    ws: BridgeSocket,
    mut outbox: mpsc::UnboundedReceiver<String>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        tokio::select! {
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => match Inbound::parse(text) {
                    Ok(inbound) => {
                        trace!(raw = %inbound.raw, "frame from bridge");
                        inner.router.dispatch(inbound);
                    }
                    Err(e) => warn!(error = %e, "dropping malformed frame from bridge"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "bridge socket error");
                    break;
                }
            },
            outgoing = outbox.recv() => {
                let Some(text) = outgoing else { break };
                if let Err(e) = ws_tx.send(Message::Text(text)).await {
                    warn!(error = %e, "bridge send failed");
                    break;
                }
            }
            () = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                // Flush frames queued before close.
                while let Ok(text) = outbox.try_recv() {
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    debug!("bridge session ended");
    inner.finish();
}

#[async_trait]
impl Link for BridgeClient {
    async fn connect(&self) -> Result<(), ConnectError> {
        let span = self.inner.span.clone();
        self.open().instrument(span).await
    }

    fn send(&self, mut frame: Frame) -> Result<(), SendError> {
        let state = *self.inner.state.borrow();
        if !state.is_open() {
            return Err(SendError::NotOpen(state));
        }
        frame.normalize();
        let text = frame.to_json()?;
        self.inner.outbox.send(text).map_err(|_| SendError::Closed)
    }

    fn send_raw(&self, text: String) -> Result<(), SendError> {
        let state = *self.inner.state.borrow();
        if !state.is_open() {
            return Err(SendError::NotOpen(state));
        }
        Frame::parse(&text).map_err(|e| SendError::Malformed(e.to_string()))?;
        self.inner.outbox.send(text).map_err(|_| SendError::Closed)
    }

    fn router(&self) -> &Router {
        &self.inner.router
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.lifecycle.subscribe()
    }

    fn close(&self) {
        self.inner.shutdown.send_replace(true);
        if *self.inner.state.borrow() != ConnectionState::Connected {
            self.inner.finish();
        }
    }
}
