//! Broadcast bridge: one upstream session shared by many WebSocket clients.
//!
//! Every frame the upstream router dispatches is written verbatim to each
//! connected client. Frames a client sends are checked to parse and then
//! forwarded upstream as the exact text the client wrote, through
//! [`Link::send_raw`]. The bridge is
//! itself a [`Link`], so in-process consumers can subscribe to it exactly as
//! they would to a direct [`Connection`].
//!
//! Correlation ids are chosen by whoever issues a request, and responses
//! are broadcast to everyone. Two downstream clients that pick the same id
//! at the same moment will both see the first matching response; each
//! client resolves its own requests on its side of the socket.

use crate::config::{BridgeConfig, ClientConfig};
use crate::connection::{Connection, ConnectionState, Link, LinkEvent};
use crate::error::{BridgeError, ConnectError, SendError};
use crate::router::{Route, Router, Subscription};
use crate::transport::open_default_peer;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use qlink_common::Frame;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn, Instrument, Span};

/// Default per-client queue depth before a slow client is dropped.
pub const DEFAULT_CLIENT_QUEUE: usize = 256;

/// Where the bridge's upstream connection comes from.
pub enum ConnectionSource {
    /// An already constructed connection, connected or not.
    Prebuilt(Connection),
    /// Build a connection from config on the compiled-in peer engine.
    Config(ClientConfig),
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Address to accept WebSocket clients on.
    pub listen: String,
    /// Frames buffered per client.
    pub client_queue: usize,
}

impl BridgeOptions {
    /// Options listening on `listen` with the default queue depth.
    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            client_queue: DEFAULT_CLIENT_QUEUE,
        }
    }
}

impl From<&BridgeConfig> for BridgeOptions {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            listen: config.listen.clone(),
            client_queue: config.client_queue,
        }
    }
}

type ClientSet = DashMap<u64, mpsc::Sender<Arc<str>>>;

struct Shared {
    upstream: Connection,
    clients: ClientSet,
    next_client: AtomicU64,
    client_queue: usize,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn add_client(&self) -> (u64, mpsc::Receiver<Arc<str>>) {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.client_queue);
        self.clients.insert(id, tx);
        (id, rx)
    }

    /// Queues `text` for every client. Clients whose queue is full or
    /// closed are removed.
    fn broadcast(&self, text: &Arc<str>) -> usize {
        let mut dropped = Vec::new();
        for client in &self.clients {
            if let Err(e) = client.value().try_send(Arc::clone(text)) {
                let full = matches!(e, mpsc::error::TrySendError::Full(_));
                dropped.push((*client.key(), full));
            }
        }
        for (id, full) in &dropped {
            if *full {
                warn!(client = id, "client queue full, dropping client");
            }
            self.clients.remove(id);
        }
        self.clients.len()
    }
}

/// A running broadcast bridge.
#[derive(Clone)]
pub struct Bridge {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
}

impl Bridge {
    /// Binds the listener and starts serving clients.
    ///
    /// The upstream connection is not connected here; call
    /// [`Link::connect`] on the bridge. Clients may attach before that and
    /// will start receiving frames once the upstream session is up.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Upstream`] if no peer engine is available for
    /// a [`ConnectionSource::Config`] source, or [`BridgeError::Bind`] if
    /// the listen address cannot be bound.
    pub async fn new(
        source: ConnectionSource,
        options: BridgeOptions,
        span: Span,
    ) -> Result<Self, BridgeError> {
        let upstream = match source {
            ConnectionSource::Prebuilt(connection) => connection,
            ConnectionSource::Config(config) => {
                let peer = open_default_peer().await?;
                Connection::from_config(&config, peer, span.clone())
            }
        };

        let listener = TcpListener::bind(&options.listen)
            .await
            .map_err(|source| BridgeError::Bind {
                addr: options.listen.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "bridge listening");

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            upstream,
            clients: DashMap::new(),
            next_client: AtomicU64::new(1),
            client_queue: options.client_queue.max(1),
            shutdown,
        });

        let frames = shared.upstream.router().subscribe(Route::Any);
        tokio::spawn(fan_out(Arc::clone(&shared), frames).instrument(span.clone()));
        tokio::spawn(accept_loop(Arc::clone(&shared), listener, span.clone()).instrument(span));

        Ok(Self { shared, local_addr })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.clients.len()
    }

    /// The upstream connection.
    #[must_use]
    pub fn upstream(&self) -> &Connection {
        &self.shared.upstream
    }
}

#[async_trait]
impl Link for Bridge {
    async fn connect(&self) -> Result<(), ConnectError> {
        self.shared.upstream.connect().await
    }

    fn send(&self, frame: Frame) -> Result<(), SendError> {
        self.shared.upstream.send(frame)
    }

    fn send_raw(&self, text: String) -> Result<(), SendError> {
        self.shared.upstream.send_raw(text)
    }

    fn router(&self) -> &Router {
        self.shared.upstream.router()
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.upstream.state()
    }

    fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.upstream.events()
    }

    fn close(&self) {
        self.shared.shutdown.send_replace(true);
        self.shared.clients.clear();
        self.shared.upstream.close();
    }
}

async fn fan_out(shared: Arc<Shared>, mut frames: Subscription) {
    while let Some(inbound) = frames.recv().await {
        let text: Arc<str> = Arc::from(inbound.raw.as_str());
        let reached = shared.broadcast(&text);
        debug!(kind = %inbound.frame.kind, clients = reached, "frame broadcast");
    }
    debug!("upstream router closed, fan-out stopped");
    // Stop accepting before dropping clients so none attach afterwards.
    shared.shutdown.send_replace(true);
    shared.clients.clear();
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, span: Span) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(
                        async move {
                            if let Err(e) = serve_client(shared, stream, peer).await {
                                debug!(%peer, error = %e, "client session ended with error");
                            }
                        }
                        .instrument(span.clone()),
                    );
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }
    info!("bridge listener stopped");
}

async fn serve_client(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (id, mut queue) = shared.add_client();
    if *shared.shutdown.borrow() {
        shared.clients.remove(&id);
        debug!(%peer, "bridge shutting down, refusing client");
        let _ = ws_tx.send(Message::Close(None)).await;
        return Ok(());
    }
    info!(client = id, %peer, "client connected");

    let result = loop {
        tokio::select! {
            outgoing = queue.recv() => {
                // `None` means the bridge removed this client.
                let Some(text) = outgoing else {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break Ok(());
                };
                if let Err(e) = ws_tx.send(Message::Text(text.to_string())).await {
                    break Err(e);
                }
            }
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => forward_upstream(&shared, id, text),
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e),
            },
        }
    };

    shared.clients.remove(&id);
    info!(client = id, "client disconnected");
    result
}

fn forward_upstream(shared: &Shared, client: u64, text: String) {
    match shared.upstream.send_raw(text) {
        Ok(()) => {}
        Err(SendError::Malformed(e)) => {
            warn!(client, error = %e, "dropping malformed client frame");
        }
        Err(e) => warn!(client, error = %e, "client frame not forwarded"),
    }
}
