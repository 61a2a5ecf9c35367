//! Inbound frame routing.
//!
//! Two tables sit behind one mutex: typed subscribers keyed by [`Route`],
//! and one-shot waiters keyed by [`CorrelationKey`]. Every mutation and
//! every delivery happens under the lock, so a waiter never fires after it
//! has been removed and a removal never races a delivery.

use crate::error::RequestError;
use qlink_common::frame::{Frame, MessageKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// A parsed inbound frame and the exact text it was parsed from.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// Parsed frame.
    pub frame: Frame,
    /// Wire text, byte-identical to what arrived.
    pub raw: String,
}

impl Inbound {
    /// Parses `raw` into an inbound frame.
    ///
    /// # Errors
    ///
    /// Returns the frame error for malformed text or unknown kinds.
    pub fn parse(raw: String) -> Result<Self, qlink_common::FrameError> {
        let frame = Frame::parse(&raw)?;
        Ok(Self { frame, raw })
    }
}

/// Subscriber selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Every dispatched frame.
    Any,
    /// Frames of one kind.
    Kind(MessageKind),
}

/// Key a request waits on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// Bare correlation id, any topic.
    Id(u32),
    /// Correlation id on one topic.
    Topic {
        /// Topic the response arrives on.
        topic: String,
        /// Correlation id.
        id: u32,
    },
}

impl CorrelationKey {
    /// The correlation id.
    #[must_use]
    pub fn id(&self) -> u32 {
        match self {
            Self::Id(id) | Self::Topic { id, .. } => *id,
        }
    }
}

type Reply = Result<Arc<Inbound>, RequestError>;

struct Waiter {
    token: u64,
    tx: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct Table {
    next_token: u64,
    subscribers: HashMap<Route, Vec<(u64, mpsc::UnboundedSender<Arc<Inbound>>)>>,
    pending: HashMap<CorrelationKey, Waiter>,
}

impl Table {
    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

fn lock(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes inbound frames to subscribers and pending requests.
#[derive(Clone, Default)]
pub struct Router {
    table: Arc<Mutex<Table>>,
}

impl Router {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to `route`. Dropping the subscription deregisters it.
    pub fn subscribe(&self, route: Route) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = lock(&self.table);
        let token = table.token();
        table.subscribers.entry(route).or_default().push((token, tx));
        Subscription {
            route,
            token,
            rx,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Registers the single waiter for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::IdInUse`] if a waiter for `key` exists.
    pub fn register(&self, key: CorrelationKey) -> Result<Pending, RequestError> {
        let mut table = lock(&self.table);
        if table.pending.contains_key(&key) {
            return Err(RequestError::IdInUse(key.id()));
        }
        let token = table.token();
        let (tx, rx) = oneshot::channel();
        table.pending.insert(key.clone(), Waiter { token, tx });
        Ok(Pending {
            key,
            token,
            rx,
            table: Arc::downgrade(&self.table),
        })
    }

    /// Delivers `inbound` in order: subscribers of its kind, catch-all
    /// subscribers, the topic+id waiter, then the bare-id waiter.
    ///
    /// An identity id of `0` marks an uncorrelated frame and never resolves
    /// a waiter.
    ///
    /// Returns how many receivers accepted it.
    pub fn dispatch(&self, inbound: Inbound) -> usize {
        let inbound = Arc::new(inbound);
        let mut table = lock(&self.table);
        let mut delivered = 0;

        for route in [Route::Kind(inbound.frame.kind), Route::Any] {
            let Some(subs) = table.subscribers.get_mut(&route) else {
                continue;
            };
            subs.retain(|(_, tx)| {
                let ok = tx.send(Arc::clone(&inbound)).is_ok();
                delivered += usize::from(ok);
                ok
            });
            if subs.is_empty() {
                table.subscribers.remove(&route);
            }
        }

        if let Some(id) = inbound.frame.correlation_id().filter(|id| *id != 0) {
            let keys = [
                CorrelationKey::Topic {
                    topic: inbound.frame.topic_str().to_owned(),
                    id,
                },
                CorrelationKey::Id(id),
            ];
            for key in keys {
                if let Some(waiter) = table.pending.remove(&key) {
                    if waiter.tx.send(Ok(Arc::clone(&inbound))).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }

        delivered
    }

    /// Rejects every pending request with `err`.
    pub fn fail_pending(&self, err: &RequestError) {
        let drained: Vec<Waiter> = lock(&self.table).pending.drain().map(|(_, w)| w).collect();
        for waiter in drained {
            let _ = waiter.tx.send(Err(err.clone()));
        }
    }

    /// Rejects pending requests with [`RequestError::Disconnected`] and ends
    /// every subscription stream.
    pub fn close(&self) {
        self.fail_pending(&RequestError::Disconnected);
        lock(&self.table).subscribers.clear();
    }

    /// Number of pending requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.table).pending.len()
    }

    /// Number of live subscribers on `route`.
    #[must_use]
    pub fn subscriber_count(&self, route: Route) -> usize {
        lock(&self.table).subscribers.get(&route).map_or(0, Vec::len)
    }
}

/// A stream of frames for one [`Route`].
pub struct Subscription {
    route: Route,
    token: u64,
    rx: mpsc::UnboundedReceiver<Arc<Inbound>>,
    table: Weak<Mutex<Table>>,
}

impl Subscription {
    /// Waits for the next frame. `None` once the router has closed.
    pub async fn recv(&mut self) -> Option<Arc<Inbound>> {
        self.rx.recv().await
    }

    /// Returns a frame if one is queued.
    pub fn try_recv(&mut self) -> Option<Arc<Inbound>> {
        self.rx.try_recv().ok()
    }

    /// The route this subscription listens on.
    #[must_use]
    pub fn route(&self) -> Route {
        self.route
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut table = lock(&table);
        if let Some(subs) = table.subscribers.get_mut(&self.route) {
            subs.retain(|(token, _)| *token != self.token);
            if subs.is_empty() {
                table.subscribers.remove(&self.route);
            }
        }
    }
}

/// A registered one-shot waiter. Dropping it deregisters the waiter.
pub struct Pending {
    key: CorrelationKey,
    token: u64,
    rx: oneshot::Receiver<Reply>,
    table: Weak<Mutex<Table>>,
}

impl Pending {
    /// The key this waiter is registered under.
    #[must_use]
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Waits up to `timeout` for the correlated frame.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Timeout`] if nothing arrives in time (the
    /// waiter is removed first, so a late frame cannot resolve it), or
    /// [`RequestError::Disconnected`] if the link closed.
    pub async fn wait(mut self, timeout: Duration) -> Result<Arc<Inbound>, RequestError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RequestError::Disconnected),
            Err(_) => {
                // Dispatch removes and sends under the lock, so if the entry
                // is already gone the reply is in the channel.
                if !self.deregister() {
                    if let Ok(reply) = self.rx.try_recv() {
                        return reply;
                    }
                }
                Err(RequestError::Timeout {
                    id: self.key.id(),
                    after: timeout,
                })
            }
        }
    }

    fn deregister(&self) -> bool {
        let Some(table) = self.table.upgrade() else {
            return false;
        };
        let mut table = lock(&table);
        match table.pending.get(&self.key) {
            Some(waiter) if waiter.token == self.token => {
                table.pending.remove(&self.key);
                true
            }
            _ => false,
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.deregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(text: &str) -> Inbound {
        Inbound::parse(text.to_string()).unwrap()
    }

    fn response(topic: &str, id: u32) -> Inbound {
        inbound(&format!(
            r#"{{"type":"res","topic":"{topic}","data":{{"header":{{"identity":{{"id":{id},"api_id":1004}}}},"data":"ok"}}}}"#
        ))
    }

    #[tokio::test]
    async fn typed_and_catch_all_subscribers_both_receive() {
        let router = Router::new();
        let mut typed = router.subscribe(Route::Kind(MessageKind::Msg));
        let mut other = router.subscribe(Route::Kind(MessageKind::Res));
        let mut any = router.subscribe(Route::Any);

        let delivered = router.dispatch(inbound(r#"{"type":"msg","topic":"rt/x","data":{}}"#));
        assert_eq!(delivered, 2);
        assert_eq!(typed.recv().await.unwrap().frame.topic_str(), "rt/x");
        assert_eq!(any.recv().await.unwrap().frame.kind, MessageKind::Msg);
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropped_subscription_is_removed() {
        let router = Router::new();
        let sub = router.subscribe(Route::Any);
        let _keep = router.subscribe(Route::Any);
        assert_eq!(router.subscriber_count(Route::Any), 2);
        drop(sub);
        assert_eq!(router.subscriber_count(Route::Any), 1);
    }

    #[tokio::test]
    async fn zero_id_does_not_resolve_waiters() {
        let router = Router::new();
        let _zero = router.register(CorrelationKey::Id(0)).unwrap();
        let mut any = router.subscribe(Route::Any);

        assert_eq!(router.dispatch(response("rt/api/sport/response", 0)), 1);
        assert!(any.try_recv().is_some());
        assert_eq!(router.pending_count(), 1);
    }

    #[tokio::test]
    async fn bare_id_waiter_resolves_on_any_topic() {
        let router = Router::new();
        let pending = router.register(CorrelationKey::Id(7)).unwrap();
        router.dispatch(response("rt/api/sport/response", 7));
        let got = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.frame.correlation_id(), Some(7));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn topic_waiter_ignores_other_topics() {
        let router = Router::new();
        let pending = router
            .register(CorrelationKey::Topic {
                topic: "rt/api/sport/response".into(),
                id: 9,
            })
            .unwrap();
        router.dispatch(response("rt/api/vui/request", 9));
        assert_eq!(router.pending_count(), 1);
        router.dispatch(response("rt/api/sport/response", 9));
        assert!(pending.wait(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn one_frame_fires_both_topic_and_id_waiters() {
        let router = Router::new();
        let by_topic = router
            .register(CorrelationKey::Topic {
                topic: "rt/t".into(),
                id: 3,
            })
            .unwrap();
        let by_id = router.register(CorrelationKey::Id(3)).unwrap();
        assert_eq!(router.dispatch(response("rt/t", 3)), 2);
        assert!(by_topic.wait(Duration::from_secs(1)).await.is_ok());
        assert!(by_id.wait(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_registration_is_refused() {
        let router = Router::new();
        let _first = router.register(CorrelationKey::Id(5)).unwrap();
        assert!(matches!(
            router.register(CorrelationKey::Id(5)),
            Err(RequestError::IdInUse(5))
        ));
    }

    #[tokio::test]
    async fn timeout_removes_waiter_and_late_frame_is_ignored() {
        let router = Router::new();
        let pending = router.register(CorrelationKey::Id(11)).unwrap();
        let err = pending.wait(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, RequestError::Timeout { id: 11, .. }));
        assert_eq!(router.pending_count(), 0);
        assert_eq!(router.dispatch(response("rt/x", 11)), 0);
    }

    #[tokio::test]
    async fn stale_guard_does_not_remove_newer_registration() {
        let router = Router::new();
        let first = router.register(CorrelationKey::Id(12)).unwrap();
        router.dispatch(response("rt/x", 12));
        let second = router.register(CorrelationKey::Id(12)).unwrap();
        drop(first);
        assert_eq!(router.pending_count(), 1);
        router.dispatch(response("rt/x", 12));
        assert!(second.wait(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn close_rejects_pending_and_ends_streams() {
        let router = Router::new();
        let pending = router.register(CorrelationKey::Id(1)).unwrap();
        let mut sub = router.subscribe(Route::Any);
        router.close();
        assert!(matches!(
            pending.wait(Duration::from_secs(1)).await,
            Err(RequestError::Disconnected)
        ));
        assert!(sub.recv().await.is_none());
    }
}
