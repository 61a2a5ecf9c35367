//! Protocol dispatcher over one peer session.
//!
//! A [`Connection`] owns the state machine
//! `Idle -> Handshaking -> AwaitingValidation -> Connected -> Disconnected`,
//! answers validation challenges, keeps the session alive with heartbeats
//! and routes every inbound frame through its [`Router`]. State only moves
//! forward; a disconnected connection stays disconnected.

use crate::config::ClientConfig;
use crate::error::{ConnectError, SendError};
use crate::router::{Inbound, Router};
use crate::transport::{PeerEvent, PeerHandle, PeerSession, TrackInfo, Transport};
use async_trait::async_trait;
use chrono::Utc;
use qlink_common::crypto;
use qlink_common::frame::{Frame, MessageKind, Payload};
use qlink_common::signaling::{LocalSignaler, RemoteSignaler};
use qlink_common::types::{VALIDATION_OK, VENDOR_PREFIX};
use qlink_common::Signaler;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn, Instrument, Span};

const LIFECYCLE_CAPACITY: usize = 64;

/// Lifecycle of a link. Ordered: a link never moves to an earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Constructed, `connect` not yet called.
    Idle,
    /// Signaling and offer/answer in progress.
    Handshaking,
    /// Data channel open, answering validation challenges.
    AwaitingValidation,
    /// Validated; heartbeats running.
    Connected,
    /// Closed. Terminal.
    Disconnected,
}

impl ConnectionState {
    /// Whether frames may be sent in this state.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::AwaitingValidation | Self::Connected)
    }
}

/// Lifecycle events of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The session was validated.
    Connected,
    /// The link closed.
    Disconnected,
    /// A remote media track arrived.
    Track(TrackInfo),
}

/// Anything that carries frames to and from the robot: a direct
/// [`Connection`], a bridge, or a client of a bridge.
#[async_trait]
pub trait Link: Send + Sync {
    /// Establishes the link and waits until it is ready for commands.
    ///
    /// # Errors
    ///
    /// Returns the reason the link could not be established.
    async fn connect(&self) -> Result<(), ConnectError>;

    /// Queues a frame for sending. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NotOpen`] before the channel opens or after it
    /// closes.
    fn send(&self, frame: Frame) -> Result<(), SendError>;

    /// Queues `text` exactly as given once it parses as a frame. Used to
    /// relay frames from elsewhere without re-encoding them.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Malformed`] if `text` is not a frame, and
    /// [`SendError::NotOpen`] as for [`Link::send`].
    fn send_raw(&self, text: String) -> Result<(), SendError>;

    /// The router inbound frames are dispatched through.
    fn router(&self) -> &Router;

    /// Watches the link state.
    fn state(&self) -> watch::Receiver<ConnectionState>;

    /// Subscribes to lifecycle events.
    fn events(&self) -> broadcast::Receiver<LinkEvent>;

    /// Closes the link. Idempotent.
    fn close(&self);

    /// Waits until the link is connected.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Disconnected`] if the link closes first.
    async fn ready(&self) -> Result<(), ConnectError> {
        let mut state = self.state();
        let reached = state
            .wait_for(|s| *s >= ConnectionState::Connected)
            .await
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected);
        if reached == ConnectionState::Connected {
            Ok(())
        } else {
            Err(ConnectError::Disconnected)
        }
    }
}

/// Tunables for a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Robot IP address.
    pub ip: String,
    /// Token merged into the offer.
    pub token: Option<String>,
    /// Heartbeat period once connected.
    pub heartbeat_period: Duration,
    /// Challenges answered before giving up.
    pub max_validation_attempts: u32,
    /// Prefix hashed with each challenge.
    pub vendor_prefix: String,
    /// Deadline for `connect` as a whole.
    pub connect_timeout: Duration,
}

impl ConnectionOptions {
    /// Options with defaults for the robot at `ip`.
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            token: None,
            heartbeat_period: Duration::from_millis(2000),
            max_validation_attempts: 8,
            vendor_prefix: VENDOR_PREFIX.to_string(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&ClientConfig> for ConnectionOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            ip: config.robot.ip.clone(),
            token: config.token().map(str::to_owned),
            heartbeat_period: Duration::from_millis(config.heartbeat.period_ms),
            max_validation_attempts: config.validation.max_attempts,
            vendor_prefix: config.validation.vendor_prefix.clone(),
            connect_timeout: Duration::from_millis(config.robot.connect_timeout_ms),
        }
    }
}

/// Picks the signaler a config asks for: a proxy when `signaling_url` is
/// set, the robot's own endpoint otherwise.
pub fn signaler_for(config: &ClientConfig) -> Arc<dyn Signaler> {
    let timeout = Duration::from_millis(config.robot.signaling_timeout_ms);
    if config.robot.signaling_url.is_empty() {
        Arc::new(LocalSignaler::new(config.robot.signaling_port).with_timeout(timeout))
    } else {
        Arc::new(RemoteSignaler::new(config.robot.signaling_url.clone()).with_timeout(timeout))
    }
}

#[derive(Debug, Clone, Copy)]
enum CloseReason {
    Local,
    ChannelClosed,
    ValidationExhausted(u32),
}

struct Pipes {
    events: mpsc::UnboundedReceiver<PeerEvent>,
    outbox: mpsc::UnboundedReceiver<String>,
}

struct Inner {
    options: ConnectionOptions,
    transport: Transport,
    router: Router,
    state: watch::Sender<ConnectionState>,
    lifecycle: broadcast::Sender<LinkEvent>,
    outbox: mpsc::UnboundedSender<String>,
    pipes: Mutex<Option<Pipes>>,
    shutdown: watch::Sender<bool>,
    close_reason: Mutex<Option<CloseReason>>,
    span: Span,
}

/// A direct, validated session with the robot.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Creates an idle connection over `peer`.
    ///
    /// `span` is entered by every task the connection spawns.
    pub fn new(
        options: ConnectionOptions,
        peer: PeerHandle,
        signaler: Arc<dyn Signaler>,
        span: Span,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let PeerHandle { session, events } = peer;
        Self {
            inner: Arc::new(Inner {
                options,
                transport: Transport::new(session, signaler),
                router: Router::new(),
                state,
                lifecycle,
                outbox,
                pipes: Mutex::new(Some(Pipes {
                    events,
                    outbox: outbox_rx,
                })),
                shutdown,
                close_reason: Mutex::new(None),
                span,
            }),
        }
    }

    /// Creates an idle connection configured from `config`.
    pub fn from_config(config: &ClientConfig, peer: PeerHandle, span: Span) -> Self {
        Self::new(ConnectionOptions::from(config), peer, signaler_for(config), span)
    }

    /// Current state.
    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    async fn establish(&self) -> Result<(), ConnectError> {
        let inner = &self.inner;
        let started = inner.state.send_if_modified(|s| {
            if *s == ConnectionState::Idle {
                *s = ConnectionState::Handshaking;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ConnectError::AlreadyStarted(self.current_state()));
        }
        info!(ip = %inner.options.ip, "connecting");

        let pipes = inner
            .pipes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(pipes) = pipes else {
            return Err(ConnectError::AlreadyStarted(self.current_state()));
        };

        if let Err(e) = inner
            .transport
            .negotiate(&inner.options.ip, inner.options.token.as_deref())
            .await
        {
            warn!(error = %e, "handshake failed");
            inner.finish(CloseReason::Local).await;
            return Err(e);
        }

        let writer = write_loop(
            Arc::clone(inner.transport.peer()),
            pipes.outbox,
            inner.shutdown.subscribe(),
        );
        tokio::spawn(writer.instrument(inner.span.clone()));
        tokio::spawn(drive(Arc::clone(inner), pipes.events).instrument(inner.span.clone()));

        match tokio::time::timeout(inner.options.connect_timeout, self.ready()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(inner.close_error()),
            Err(_) => {
                warn!(timeout = ?inner.options.connect_timeout, "session not validated in time");
                self.close();
                Err(ConnectError::Timeout(inner.options.connect_timeout))
            }
        }
    }
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

    fn enqueue(&self, frame: &Frame) -> Result<(), SendError> {
        let text = frame.to_json()?;
        self.outbox.send(text).map_err(|_| SendError::Closed)
    }

    fn close_error(&self) -> ConnectError {
        let reason = *self
            .close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match reason {
            Some(CloseReason::ValidationExhausted(n)) => ConnectError::ValidationExhausted(n),
            _ => ConnectError::Disconnected,
        }
    }

    async fn finish(&self, reason: CloseReason) {
        {
            let mut slot = self
                .close_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            slot.get_or_insert(reason);
        }
        if self.advance(ConnectionState::Disconnected) {
            info!(?reason, "disconnected");
            self.router.close();
            let _ = self.lifecycle.send(LinkEvent::Disconnected);
            self.shutdown.send_replace(true);
            if let Err(e) = self.transport.peer().close().await {
                debug!(error = %e, "peer close failed");
            }
        }
    }
}

#[async_trait]
impl Link for Connection {
    async fn connect(&self) -> Result<(), ConnectError> {
        let span = self.inner.span.clone();
        self.establish().instrument(span).await
    }

    fn send(&self, mut frame: Frame) -> Result<(), SendError> {
        let state = self.current_state();
        if !state.is_open() {
            return Err(SendError::NotOpen(state));
        }
        frame.normalize();
        if frame.kind != MessageKind::Heartbeat {
            debug!(kind = %frame.kind, topic = frame.topic_str(), "sending frame");
        }
        self.inner.enqueue(&frame)
    }

    fn send_raw(&self, text: String) -> Result<(), SendError> {
        let state = self.current_state();
        if !state.is_open() {
            return Err(SendError::NotOpen(state));
        }
        let frame = Frame::parse(&text).map_err(|e| SendError::Malformed(e.to_string()))?;
        debug!(kind = %frame.kind, topic = frame.topic_str(), "relaying frame");
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
        if self.current_state() < ConnectionState::AwaitingValidation {
            // No driver is running yet.
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.finish(CloseReason::Local).await });
        }
    }
}

async fn write_loop(
    peer: Arc<dyn PeerSession>,
    mut outbox: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        // Queued frames are written before shutdown is honoured.
        tokio::select! {
            biased;
            next = outbox.recv() => {
                let Some(text) = next else { break };
                if let Err(e) = peer.send_text(&text).await {
                    warn!(error = %e, "data channel send failed");
                }
            }
            () = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

struct Validation {
    attempts: u32,
}

enum Flow {
    Continue,
    Stop(CloseReason),
}

async fn drive(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut heartbeat: Option<Interval> = None;
    let mut validation = Validation { attempts: 0 };

    let reason = loop {
        tokio::select! {
            event = events.recv() => match event {
                None | Some(PeerEvent::ChannelClosed) => {
                    warn!("data channel closed");
                    break CloseReason::ChannelClosed;
                }
                Some(PeerEvent::ChannelOpen) => {
                    if inner.advance(ConnectionState::AwaitingValidation) {
                        info!("data channel open, awaiting validation");
                    }
                }
                Some(PeerEvent::Track(track)) => {
                    debug!(kind = ?track.kind, id = %track.id, "remote track");
                    let _ = inner.lifecycle.send(LinkEvent::Track(track));
                }
                Some(PeerEvent::Message(raw)) => {
                    if let Flow::Stop(reason) = on_message(&inner, raw, &mut validation, &mut heartbeat) {
                        break reason;
                    }
                }
            },
            () = next_tick(&mut heartbeat) => {
                let frame = Frame::heartbeat(Utc::now());
                if let Err(e) = inner.enqueue(&frame) {
                    debug!(error = %e, "heartbeat not queued");
                }
            }
            _ = shutdown.wait_for(|stop| *stop) => break CloseReason::Local,
        }
    };

    inner.finish(reason).await;
}

fn on_message(
    inner: &Inner,
    raw: String,
    validation: &mut Validation,
    heartbeat: &mut Option<Interval>,
) -> Flow {
    let inbound = match Inbound::parse(raw) {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!(error = %e, "dropping malformed frame");
            return Flow::Continue;
        }
    };
    if inbound.frame.kind != MessageKind::Heartbeat {
        trace!(raw = %inbound.raw, "frame received");
    }

    if inbound.frame.kind == MessageKind::Validation
        && *inner.state.borrow() == ConnectionState::AwaitingValidation
    {
        let challenge = match &inbound.frame.data {
            Some(Payload::Text(text)) => Some(text.as_str()),
            _ => None,
        };
        match challenge {
            Some(VALIDATION_OK) => {
                inner.advance(ConnectionState::Connected);
                info!(attempts = validation.attempts, "validation passed");
                let mut interval = tokio::time::interval(inner.options.heartbeat_period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *heartbeat = Some(interval);
                let _ = inner.lifecycle.send(LinkEvent::Connected);
            }
            Some(challenge) => {
                validation.attempts += 1;
                if validation.attempts > inner.options.max_validation_attempts {
                    warn!(
                        attempts = validation.attempts - 1,
                        "validation not accepted, giving up"
                    );
                    return Flow::Stop(CloseReason::ValidationExhausted(
                        inner.options.max_validation_attempts,
                    ));
                }
                let reply = crypto::validation_reply(&inner.options.vendor_prefix, challenge);
                debug!(attempt = validation.attempts, "answering validation challenge");
                if let Err(e) = inner.enqueue(&Frame::validation(reply)) {
                    warn!(error = %e, "validation reply not queued");
                }
            }
            None => debug!("validation frame without a text challenge"),
        }
    }

    inner.router.dispatch(inbound);
    Flow::Continue
}
