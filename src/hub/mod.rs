//! Subscriber hub: fans cluster watch events out to browser sessions.
//!
//! The hub owns the set of connected [`SubscriberSession`]s. Register and
//! unregister take the write lock; [`Hub::broadcast`] holds only the read
//! lock and never awaits, so a slow browser can delay neither the producer
//! nor any other session. A session whose outbound queue is full simply
//! misses that event.

pub mod key;
pub mod session;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

pub use key::SubscriptionKey;

use crate::tunnel::EventType;

/// A decoded watch event as delivered to browsers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubEvent {
    pub cluster: String,
    pub resource: String,
    pub namespace: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub object: Value,
}

impl HubEvent {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(&self.cluster, &self.resource, &self.namespace)
    }
}

/// An event serialized once and shared by every recipient.
#[derive(Debug, Clone)]
pub struct BroadcastEnvelope {
    pub key: SubscriptionKey,
    pub payload: Arc<str>,
}

/// Callback run synchronously for every broadcast event.
///
/// Hooks run on the producer's task before fan-out. They **must not block**;
/// anything slow belongs on a queue the hook hands the event to.
pub type EventHook = Arc<dyn Fn(&HubEvent) + Send + Sync>;

/// Where decoded watch events go. Implemented by [`Hub`]; the tunnel relay
/// only depends on this trait.
pub trait BroadcastSink: Send + Sync {
    fn publish(&self, event: HubEvent);
}

/// One connected browser.
pub struct SubscriberSession {
    id: Uuid,
    principal: String,
    subscriptions: RwLock<HashSet<SubscriptionKey>>,
    /// Dropped by [`Hub::unregister`] to close the writer's queue.
    outbound: Mutex<Option<mpsc::Sender<Arc<str>>>>,
    dropped: AtomicU64,
}

impl SubscriberSession {
    /// Create a session and the receiving end of its outbound queue.
    pub fn new(principal: impl Into<String>, queue: usize) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(queue);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            principal: principal.into(),
            subscriptions: RwLock::new(HashSet::new()),
            outbound: Mutex::new(Some(tx)),
            dropped: AtomicU64::new(0),
        });
        (session, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Only the session's own reader calls this.
    pub fn subscribe(&self, key: SubscriptionKey) -> bool {
        self.subscriptions.write().insert(key)
    }

    /// Only the session's own reader calls this.
    pub fn unsubscribe(&self, key: &SubscriptionKey) -> bool {
        self.subscriptions.write().remove(key)
    }

    pub fn is_subscribed(&self, key: &SubscriptionKey) -> bool {
        self.subscriptions.read().contains(key)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Events dropped because this session's queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Non-blocking enqueue. Returns false if the event was not queued.
    fn offer(&self, payload: &Arc<str>) -> bool {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return false;
        };
        match tx.try_send(Arc::clone(payload)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn close(&self) {
        self.outbound.lock().take();
    }
}

/// Registry of connected subscriber sessions plus broadcast hooks.
#[derive(Default)]
pub struct Hub {
    sessions: RwLock<HashMap<Uuid, Arc<SubscriberSession>>>,
    hooks: RwLock<Vec<EventHook>>,
    dropped: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<SubscriberSession>) {
        debug!(session_id = %session.id, principal = %session.principal, "Hub: session registered");
        self.sessions.write().insert(session.id, session);
    }

    /// Remove a session and close its outbound queue. Idempotent.
    pub fn unregister(&self, session_id: Uuid) -> bool {
        let removed = self.sessions.write().remove(&session_id);
        match removed {
            Some(session) => {
                session.close();
                debug!(session_id = %session_id, "Hub: session unregistered");
                true
            }
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Total events dropped across all sessions because of full queues.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn add_hook(&self, hook: EventHook) {
        self.hooks.write().push(hook);
    }

    /// Run hooks, serialize `event` once and offer it to every session
    /// subscribed to `key`. Returns the number of sessions that queued it.
    pub fn broadcast(&self, key: &SubscriptionKey, event: &HubEvent) -> usize {
        for hook in self.hooks.read().iter() {
            hook(event);
        }

        let payload: Arc<str> = match serde_json::to_string(event) {
            Ok(text) => text.into(),
            Err(e) => {
                warn!(key = %key, "Hub: failed to serialize event: {e}");
                return 0;
            }
        };
        let envelope = BroadcastEnvelope {
            key: key.clone(),
            payload,
        };
        self.fan_out(&envelope)
    }

    fn fan_out(&self, envelope: &BroadcastEnvelope) -> usize {
        let sessions = self.sessions.read();
        let mut delivered = 0;
        for session in sessions.values() {
            if !session.is_subscribed(&envelope.key) {
                continue;
            }
            if session.offer(&envelope.payload) {
                delivered += 1;
            } else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    session_id = %session.id,
                    key = %envelope.key,
                    "Hub: dropped event (session backpressure)"
                );
            }
        }
        delivered
    }
}

impl BroadcastSink for Hub {
    fn publish(&self, event: HubEvent) {
        let key = event.key();
        self.broadcast(&key, &event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(cluster: &str, resource: &str, namespace: &str) -> HubEvent {
        HubEvent {
            cluster: cluster.into(),
            resource: resource.into(),
            namespace: namespace.into(),
            event_type: EventType::Added,
            object: json!({"metadata": {"name": "web-0"}}),
        }
    }

    #[test]
    fn test_broadcast_reaches_only_matching_sessions() {
        let hub = Hub::new();
        let (a, mut a_rx) = SubscriberSession::new("alice", 8);
        let (b, mut b_rx) = SubscriberSession::new("bob", 8);
        let key_a = SubscriptionKey::new("prod", "pods", "default");
        let key_b = SubscriptionKey::new("prod", "deployments", "");
        a.subscribe(key_a.clone());
        b.subscribe(key_b);
        hub.register(a);
        hub.register(b);

        let delivered = hub.broadcast(&key_a, &event("prod", "pods", "default"));
        assert_eq!(delivered, 1);

        let frame = a_rx.try_recv().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "ADDED");
        assert_eq!(value["cluster"], "prod");
        assert_eq!(value["object"]["metadata"]["name"], "web-0");
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn test_isolation_with_many_unrelated_sessions() {
        let hub = Hub::new();
        let target = SubscriptionKey::new("c1", "pods", "");
        let mut receivers = Vec::new();
        for i in 0..50 {
            let (s, rx) = SubscriberSession::new(format!("user-{i}"), 4);
            s.subscribe(SubscriptionKey::new("c1", "pods", &format!("ns-{i}")));
            hub.register(s);
            receivers.push(rx);
        }
        let (watcher, mut watcher_rx) = SubscriberSession::new("watcher", 4);
        watcher.subscribe(target.clone());
        hub.register(watcher);

        assert_eq!(hub.broadcast(&target, &event("c1", "pods", "")), 1);
        assert!(watcher_rx.try_recv().is_ok());
        for rx in &mut receivers {
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_full_queue_does_not_block_other_sessions() {
        let hub = Hub::new();
        let key = SubscriptionKey::new("c", "pods", "");
        let (slow, mut slow_rx) = SubscriberSession::new("slow", 1);
        let (fast, mut fast_rx) = SubscriberSession::new("fast", 8);
        slow.subscribe(key.clone());
        fast.subscribe(key.clone());
        hub.register(Arc::clone(&slow));
        hub.register(fast);

        for _ in 0..3 {
            hub.broadcast(&key, &event("c", "pods", ""));
        }

        let mut fast_count = 0;
        while fast_rx.try_recv().is_ok() {
            fast_count += 1;
        }
        assert_eq!(fast_count, 3);
        assert!(slow_rx.try_recv().is_ok());
        assert!(slow_rx.try_recv().is_err());
        assert_eq!(slow.dropped(), 2);
        assert_eq!(hub.dropped(), 2);
    }

    #[test]
    fn test_hooks_see_every_event() {
        let hub = Hub::new();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        hub.add_hook(Arc::new(move |ev: &HubEvent| {
            assert_eq!(ev.cluster, "c");
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        // No sessions at all: hooks still run.
        let ev = event("c", "pods", "");
        hub.publish(ev.clone());
        hub.publish(ev);
        assert_eq!(seen.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_unregister_closes_outbound_queue() {
        let hub = Hub::new();
        let (s, mut rx) = SubscriberSession::new("alice", 4);
        let id = s.id();
        hub.register(s);
        assert_eq!(hub.session_count(), 1);

        assert!(hub.unregister(id));
        assert!(!hub.unregister(id));
        assert_eq!(hub.session_count(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let hub = Hub::new();
        let key = SubscriptionKey::new("c", "pods", "");
        let (s, mut rx) = SubscriberSession::new("alice", 4);
        s.subscribe(key.clone());
        hub.register(Arc::clone(&s));

        assert_eq!(hub.broadcast(&key, &event("c", "pods", "")), 1);
        assert!(s.unsubscribe(&key));
        assert_eq!(hub.broadcast(&key, &event("c", "pods", "")), 0);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
