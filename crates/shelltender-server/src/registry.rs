//! Client registry
//!
//! Connection-manager for the multiplexer: tracks every WebSocket client,
//! its subscription set, sequence cursors, registered patterns and monitor
//! flag. Uses synchronous locks because the broadcast path is invoked from
//! the pipeline, synchronously with the PTY reader task; enqueueing is
//! `try_send` so a slow client can never block PTY reads.

use chrono::{DateTime, Utc};
use shelltender_core::OverflowPolicy;
use shelltender_types::ServerMessage;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-connection multiplexer state, guarded by a per-connection mutex.
#[derive(Debug)]
pub struct ClientState {
    pub subscribed_sessions: HashSet<String>,
    pub last_seq_per_session: HashMap<String, u64>,
    pub is_incremental: bool,
    pub registered_patterns: HashSet<String>,
    pub event_subscriptions: HashSet<String>,
    pub is_monitor: bool,
    pub admin_sessions: HashSet<String>,
    /// Sessions for which this client has received a `created`/`connect`
    /// reply; input for other sessions is rejected.
    pub ready_sessions: HashSet<String>,
    pub connected_at: DateTime<Utc>,
}

impl ClientState {
    pub fn new() -> Self {
        Self {
            subscribed_sessions: HashSet::new(),
            last_seq_per_session: HashMap::new(),
            is_incremental: false,
            registered_patterns: HashSet::new(),
            event_subscriptions: HashSet::new(),
            is_monitor: false,
            admin_sessions: HashSet::new(),
            ready_sessions: HashSet::new(),
            connected_at: Utc::now(),
        }
    }
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}

struct ClientEntry {
    tx: mpsc::Sender<ServerMessage>,
    state: Arc<Mutex<ClientState>>,
    overflowed: Arc<AtomicBool>,
}

#[derive(Default)]
struct RegistryInner {
    clients: HashMap<String, ClientEntry>,
    session_subscribers: HashMap<String, HashSet<String>>,
    monitors: HashSet<String>,
    /// pattern id -> owning client id
    pattern_owners: HashMap<String, String>,
}

/// See the module docs.
pub struct ClientRegistry {
    inner: RwLock<RegistryInner>,
    overflow_policy: OverflowPolicy,
}

impl ClientRegistry {
    pub fn new(overflow_policy: OverflowPolicy) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            overflow_policy,
        }
    }

    pub fn register(
        &self,
        client_id: &str,
        tx: mpsc::Sender<ServerMessage>,
        state: Arc<Mutex<ClientState>>,
        overflowed: Arc<AtomicBool>,
    ) {
        let mut inner = self.inner.write().unwrap();
        inner.clients.insert(
            client_id.to_string(),
            ClientEntry {
                tx,
                state,
                overflowed,
            },
        );
    }

    /// Remove the client from every index. Returns the ids of the patterns
    /// it owned so the caller can unregister them from the engine.
    pub fn unregister(&self, client_id: &str) -> Vec<String> {
        let mut inner = self.inner.write().unwrap();
        inner.clients.remove(client_id);
        inner.monitors.remove(client_id);
        for subscribers in inner.session_subscribers.values_mut() {
            subscribers.remove(client_id);
        }
        inner.session_subscribers.retain(|_, s| !s.is_empty());

        let owned: Vec<String> = inner
            .pattern_owners
            .iter()
            .filter(|(_, owner)| owner.as_str() == client_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &owned {
            inner.pattern_owners.remove(id);
        }
        owned
    }

    pub fn subscribe(&self, client_id: &str, session_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner
            .session_subscribers
            .entry(session_id.to_string())
            .or_default()
            .insert(client_id.to_string());
    }

    pub fn unsubscribe(&self, client_id: &str, session_id: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(subscribers) = inner.session_subscribers.get_mut(session_id) {
            subscribers.remove(client_id);
            if subscribers.is_empty() {
                inner.session_subscribers.remove(session_id);
            }
        }
    }

    pub fn set_monitor(&self, client_id: &str) {
        self.inner
            .write()
            .unwrap()
            .monitors
            .insert(client_id.to_string());
    }

    pub fn own_pattern(&self, pattern_id: &str, client_id: &str) {
        self.inner
            .write()
            .unwrap()
            .pattern_owners
            .insert(pattern_id.to_string(), client_id.to_string());
    }

    pub fn release_pattern(&self, pattern_id: &str) {
        self.inner.write().unwrap().pattern_owners.remove(pattern_id);
    }

    pub fn pattern_owner(&self, pattern_id: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap()
            .pattern_owners
            .get(pattern_id)
            .cloned()
    }

    pub fn client_count(&self) -> usize {
        self.inner.read().unwrap().clients.len()
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner
            .read()
            .unwrap()
            .session_subscribers
            .get(session_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn client_state(&self, client_id: &str) -> Option<Arc<Mutex<ClientState>>> {
        self.inner
            .read()
            .unwrap()
            .clients
            .get(client_id)
            .map(|entry| entry.state.clone())
    }

    /// Enqueue a frame for one client, applying the overflow policy when the
    /// bounded queue is full. Returns `false` when the client is gone or was
    /// dropped for overflow.
    pub fn send_to(&self, client_id: &str, message: ServerMessage) -> bool {
        let tx = {
            let inner = self.inner.read().unwrap();
            match inner.clients.get(client_id) {
                Some(entry) => entry.tx.clone(),
                None => return false,
            }
        };
        match tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.handle_overflow(client_id);
                false
            }
        }
    }

    fn handle_overflow(&self, client_id: &str) {
        match self.overflow_policy {
            OverflowPolicy::DropFrames => {
                debug!("dropping frame for slow client {}", client_id);
            }
            OverflowPolicy::Close => {
                warn!("closing slow client {} (outbound queue full)", client_id);
                let mut inner = self.inner.write().unwrap();
                if let Some(entry) = inner.clients.remove(client_id) {
                    entry.overflowed.store(true, Ordering::SeqCst);
                    // Dropping the sender ends the writer task, which emits
                    // the 1009 close frame when it sees the overflow flag.
                }
                inner.monitors.remove(client_id);
                for subscribers in inner.session_subscribers.values_mut() {
                    subscribers.remove(client_id);
                }
            }
        }
    }

    /// One `output` frame per subscribed client, in sequence order per
    /// client. Also advances each client's sequence cursor.
    pub fn broadcast_output(&self, session_id: &str, data: &str, sequence: u64) {
        let subscribers = self.subscribers_of(session_id);
        for client_id in subscribers {
            if let Some(state) = self.client_state(&client_id) {
                state
                    .lock()
                    .unwrap()
                    .last_seq_per_session
                    .insert(session_id.to_string(), sequence);
            }
            self.send_to(
                &client_id,
                ServerMessage::Output {
                    session_id: session_id.to_string(),
                    data: data.to_string(),
                    sequence,
                },
            );
        }
    }

    /// Firehose frame to every monitor client.
    pub fn broadcast_monitor(&self, session_id: &str, data: &str, sequence: u64) {
        let monitors: Vec<String> = self
            .inner
            .read()
            .unwrap()
            .monitors
            .iter()
            .cloned()
            .collect();
        for client_id in monitors {
            self.send_to(
                &client_id,
                ServerMessage::SessionOutput {
                    session_id: session_id.to_string(),
                    data: data.to_string(),
                    sequence,
                },
            );
        }
    }

    /// Any non-output frame to every subscriber of a session.
    pub fn broadcast_to_session(&self, session_id: &str, message: ServerMessage) {
        for client_id in self.subscribers_of(session_id) {
            self.send_to(&client_id, message.clone());
        }
    }

    /// Deliver a terminal event to a client, honoring its event-type
    /// allowlist (an empty allowlist forwards everything).
    pub fn send_event(&self, client_id: &str, message: ServerMessage, event_type: &str) -> bool {
        if let Some(state) = self.client_state(client_id) {
            let state = state.lock().unwrap();
            if !state.event_subscriptions.is_empty()
                && !state.event_subscriptions.contains(event_type)
            {
                return false;
            }
        } else {
            return false;
        }
        self.send_to(client_id, message)
    }

    /// Drop every subscription index entry for a dead session.
    pub fn drop_session(&self, session_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.session_subscribers.remove(session_id);
    }

    fn subscribers_of(&self, session_id: &str) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .session_subscribers
            .get(session_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(
        registry: &ClientRegistry,
        id: &str,
        queue: usize,
    ) -> (mpsc::Receiver<ServerMessage>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::channel(queue);
        let overflowed = Arc::new(AtomicBool::new(false));
        registry.register(id, tx, Arc::new(Mutex::new(ClientState::new())), overflowed.clone());
        (rx, overflowed)
    }

    #[tokio::test]
    async fn broadcast_reaches_only_subscribers() {
        let registry = ClientRegistry::new(OverflowPolicy::Close);
        let (mut rx_a, _) = client(&registry, "a", 8);
        let (mut rx_b, _) = client(&registry, "b", 8);
        registry.subscribe("a", "s1");

        registry.broadcast_output("s1", "hi", 1);

        let frame = rx_a.recv().await.unwrap();
        assert!(matches!(frame, ServerMessage::Output { sequence: 1, .. }));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_advances_sequence_cursor() {
        let registry = ClientRegistry::new(OverflowPolicy::Close);
        let (_rx, _) = client(&registry, "a", 8);
        registry.subscribe("a", "s1");
        registry.broadcast_output("s1", "x", 5);

        let state = registry.client_state("a").unwrap();
        assert_eq!(
            state.lock().unwrap().last_seq_per_session.get("s1"),
            Some(&5)
        );
    }

    #[tokio::test]
    async fn overflow_close_policy_drops_the_client() {
        let registry = ClientRegistry::new(OverflowPolicy::Close);
        let (_rx, overflowed) = client(&registry, "a", 1);
        registry.subscribe("a", "s1");

        // First frame fills the queue, second overflows it.
        registry.broadcast_output("s1", "one", 1);
        registry.broadcast_output("s1", "two", 2);

        assert!(overflowed.load(Ordering::SeqCst));
        assert_eq!(registry.client_count(), 0);
        assert_eq!(registry.subscriber_count("s1"), 0);
    }

    #[tokio::test]
    async fn overflow_drop_policy_keeps_the_client() {
        let registry = ClientRegistry::new(OverflowPolicy::DropFrames);
        let (mut rx, overflowed) = client(&registry, "a", 1);
        registry.subscribe("a", "s1");

        registry.broadcast_output("s1", "one", 1);
        registry.broadcast_output("s1", "two", 2);

        assert!(!overflowed.load(Ordering::SeqCst));
        assert_eq!(registry.client_count(), 1);
        // Only the first frame made it.
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerMessage::Output { sequence: 1, .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_returns_owned_patterns() {
        let registry = ClientRegistry::new(OverflowPolicy::Close);
        let (_rx, _) = client(&registry, "a", 8);
        registry.own_pattern("p1", "a");
        registry.own_pattern("p2", "a");
        registry.subscribe("a", "s1");

        let mut owned = registry.unregister("a");
        owned.sort();
        assert_eq!(owned, vec!["p1".to_string(), "p2".to_string()]);
        assert_eq!(registry.subscriber_count("s1"), 0);
        assert!(registry.pattern_owner("p1").is_none());
    }

    #[tokio::test]
    async fn event_allowlist_filters_event_types() {
        let registry = ClientRegistry::new(OverflowPolicy::Close);
        let (mut rx, _) = client(&registry, "a", 8);

        let bell = ServerMessage::Bell {
            session_id: "s1".to_string(),
        };
        // Empty allowlist forwards everything.
        assert!(registry.send_event("a", bell.clone(), "bell"));

        registry
            .client_state("a")
            .unwrap()
            .lock()
            .unwrap()
            .event_subscriptions
            .insert("exit".to_string());
        assert!(!registry.send_event("a", bell, "bell"));

        assert!(matches!(rx.recv().await.unwrap(), ServerMessage::Bell { .. }));
        assert!(rx.try_recv().is_err());
    }
}
