//! Channel-keyed publish/subscribe registry for real-time connections.
//!
//! ## Per-connection lifecycle
//!
//! ```text
//! connect() ──▶ Empty ──[subscribe]──▶ Subscribed(n) ──[unsubscribe_all]──▶ Empty
//!                 │                          │
//!                 └─────────[drop]───────────┴──────────▶ Disconnected (terminal)
//! ```
//!
//! Every connection owns a bounded queue.  Publishing never waits on a
//! subscriber: a full queue drops the event for that connection only, and
//! a closed queue removes the connection.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::alerts::AlertEvent;
use crate::sensor::Reading;

/// Default per-connection queue depth.
pub const DEFAULT_QUEUE: usize = 64;

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Channel {
    AllSensorData,
    Alerts,
    Zone(String),
    Sensor(String),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllSensorData => write!(f, "all_sensor_data"),
            Self::Alerts => write!(f, "alerts"),
            Self::Zone(id) => write!(f, "zone:{id}"),
            Self::Sensor(id) => write!(f, "sensor:{id}"),
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "all_sensor_data" => return Ok(Self::AllSensorData),
            "alerts" => return Ok(Self::Alerts),
            _ => {}
        }
        match s.split_once(':') {
            Some(("zone", id)) if !id.is_empty() => Ok(Self::Zone(id.to_string())),
            Some(("sensor", id)) if !id.is_empty() => Ok(Self::Sensor(id.to_string())),
            _ => Err(format!("unknown channel '{s}'")),
        }
    }
}

impl TryFrom<String> for Channel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Channel> for String {
    fn from(c: Channel) -> Self {
        c.to_string()
    }
}

// ---------------------------------------------------------------------------
// Events pushed to subscribers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// One tick's batch (or the zone's share of it).
    SensorData { channel: Channel, readings: Vec<Reading> },
    /// A single sensor's reading for `sensor:<id>` subscribers.
    SensorUpdate { reading: Reading },
    Alert(AlertEvent),
    /// Current state sent right after subscribing to a data channel.
    Snapshot { channel: Channel, readings: Vec<Reading> },
    Subscribed { channel: Channel },
    Unsubscribed { channel: Channel },
    Error { message: String },
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub type ConnectionId = u64;

struct Entry {
    tx: mpsc::Sender<Event>,
    channels: HashSet<Channel>,
}

#[derive(Default)]
struct Inner {
    next_id: ConnectionId,
    connections: HashMap<ConnectionId, Entry>,
}

/// Outcome of one `publish` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Subscriber queue was full; event lost for that connection only.
    pub dropped: usize,
    /// Subscriber had gone away; connection removed.
    pub closed: usize,
}

#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
    queue: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE)
    }
}

impl Registry {
    pub fn new(queue: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            queue: queue.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Entries stay consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new connection with an empty subscription set.
    pub fn connect(&self) -> (Connection, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(self.queue);
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.connections.insert(
            id,
            Entry {
                tx,
                channels: HashSet::new(),
            },
        );
        debug!(conn = id, "registry: connected");
        (
            Connection {
                id,
                registry: self.clone(),
            },
            rx,
        )
    }

    /// Push `event` to every connection subscribed to `channel`.
    pub fn publish(&self, channel: &Channel, event: Event) -> Delivery {
        let mut delivery = Delivery::default();
        let mut gone: Vec<ConnectionId> = Vec::new();

        let mut inner = self.lock();
        for (&id, entry) in inner.connections.iter() {
            if !entry.channels.contains(channel) {
                continue;
            }
            match entry.tx.try_send(event.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    delivery.dropped += 1;
                    warn!(conn = id, %channel, "registry: subscriber queue full, event dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    delivery.closed += 1;
                    gone.push(id);
                }
            }
        }
        for id in gone {
            inner.connections.remove(&id);
            debug!(conn = id, "registry: pruned closed connection");
        }

        delivery
    }

    /// Disconnect every connection.  Their queues close, so transport
    /// sessions wind down; handles still held become inert.
    pub fn close(&self) -> usize {
        let mut inner = self.lock();
        let n = inner.connections.len();
        inner.connections.clear();
        debug!(connections = n, "registry: closed");
        n
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|e| e.channels.contains(channel))
            .count()
    }

    fn remove_channel(&self, id: ConnectionId, channel: &Channel) -> bool {
        self.lock()
            .connections
            .get_mut(&id)
            .map(|e| e.channels.remove(channel))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Connection + subscription handles
// ---------------------------------------------------------------------------

/// A live real-time connection.  Dropping it disconnects.
pub struct Connection {
    id: ConnectionId,
    registry: Registry,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Join `channel`.  The returned handle is the only way to leave it
    /// again short of `unsubscribe_all` or disconnecting.
    pub fn subscribe(&self, channel: Channel) -> Subscription {
        if let Some(entry) = self.registry.lock().connections.get_mut(&self.id) {
            entry.channels.insert(channel.clone());
        }
        debug!(conn = self.id, %channel, "registry: subscribed");
        Subscription {
            conn: self.id,
            channel,
            registry: self.registry.clone(),
        }
    }

    pub fn unsubscribe_all(&self) {
        if let Some(entry) = self.registry.lock().connections.get_mut(&self.id) {
            entry.channels.clear();
        }
        debug!(conn = self.id, "registry: unsubscribed from all channels");
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.registry
            .lock()
            .connections
            .get(&self.id)
            .map(|e| e.channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Queue an event for this connection only.  Returns `false` if the
    /// queue is full or closed.
    pub fn send(&self, event: Event) -> bool {
        let tx = match self.registry.lock().connections.get(&self.id) {
            Some(e) => e.tx.clone(),
            None => return false,
        };
        tx.try_send(event).is_ok()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.registry.lock().connections.remove(&self.id);
        debug!(conn = self.id, "registry: disconnected");
    }
}

/// Capability to leave one channel.
#[must_use = "dropping a Subscription keeps the channel membership"]
pub struct Subscription {
    conn: ConnectionId,
    channel: Channel,
    registry: Registry,
}

impl Subscription {
    /// Leave the channel.  Returns `false` if the membership was already gone
    /// (connection closed or `unsubscribe_all` ran first).
    pub fn unsubscribe(self) -> bool {
        self.registry.remove_channel(self.conn, &self.channel)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;

    fn reading(sensor_id: &str) -> Reading {
        Reading {
            sensor_id: sensor_id.into(),
            zone_id: "z1".into(),
            value: 21.5,
            unit: "°C".into(),
            status: Status::Normal,
            ts: 1_700_000_000_000,
        }
    }

    fn batch_event() -> Event {
        Event::SensorData {
            channel: Channel::AllSensorData,
            readings: vec![reading("s1")],
        }
    }

    // -- Channel parsing ----------------------------------------------------

    #[test]
    fn channel_parse_and_display() {
        for s in ["all_sensor_data", "alerts", "zone:rack-a", "sensor:rack-a-temp"] {
            let c: Channel = s.parse().unwrap();
            assert_eq!(c.to_string(), s);
        }
        assert_eq!(
            "sensor:rack-a-temp".parse::<Channel>(),
            Ok(Channel::Sensor("rack-a-temp".into()))
        );
    }

    #[test]
    fn channel_parse_rejects_garbage() {
        assert!("".parse::<Channel>().is_err());
        assert!("zone:".parse::<Channel>().is_err());
        assert!("room:1".parse::<Channel>().is_err());
    }

    #[test]
    fn channel_serde_uses_string_form() {
        let json = serde_json::to_string(&Channel::Zone("a".into())).unwrap();
        assert_eq!(json, "\"zone:a\"");
        let c: Channel = serde_json::from_str("\"alerts\"").unwrap();
        assert_eq!(c, Channel::Alerts);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let v = serde_json::to_value(batch_event()).unwrap();
        assert_eq!(v["type"], "sensor_data");
        assert_eq!(v["channel"], "all_sensor_data");
        assert_eq!(v["readings"][0]["status"], "normal");
        assert!(v["readings"][0]["timestamp"].is_i64());
        assert!(v["readings"][0].get("ts").is_none());
    }

    // -- Lifecycle ----------------------------------------------------------

    #[tokio::test]
    async fn new_connection_has_no_subscriptions() {
        let registry = Registry::new(8);
        let (conn, mut rx) = registry.connect();
        assert!(conn.channels().is_empty());

        let d = registry.publish(&Channel::AllSensorData, batch_event());
        assert_eq!(d, Delivery::default());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribed_connection_receives_once() {
        let registry = Registry::new(8);
        let (conn, mut rx) = registry.connect();
        let _sub = conn.subscribe(Channel::AllSensorData);
        // Duplicate subscribe must not cause duplicate delivery.
        let _again = conn.subscribe(Channel::AllSensorData);

        let d = registry.publish(&Channel::AllSensorData, batch_event());
        assert_eq!(d.delivered, 1);
        assert!(matches!(rx.recv().await, Some(Event::SensorData { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let registry = Registry::new(8);
        let (a, mut rx_a) = registry.connect();
        let (b, mut rx_b) = registry.connect();
        let _sa = a.subscribe(Channel::Zone("z1".into()));
        let _sb = b.subscribe(Channel::Zone("z2".into()));

        registry.publish(&Channel::Zone("z1".into()), batch_event());
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_handle_leaves_only_its_channel() {
        let registry = Registry::new(8);
        let (conn, mut rx) = registry.connect();
        let data = conn.subscribe(Channel::AllSensorData);
        let _alerts = conn.subscribe(Channel::Alerts);

        assert!(data.unsubscribe());
        assert_eq!(conn.channels(), vec![Channel::Alerts]);

        registry.publish(&Channel::AllSensorData, batch_event());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_all_returns_to_empty() {
        let registry = Registry::new(8);
        let (conn, _rx) = registry.connect();
        let data = conn.subscribe(Channel::AllSensorData);
        let _alerts = conn.subscribe(Channel::Alerts);

        conn.unsubscribe_all();
        assert!(conn.channels().is_empty());
        assert_eq!(registry.subscriber_count(&Channel::Alerts), 0);
        // Handle outlived its membership.
        assert!(!data.unsubscribe());
        // Connection is still alive and can resubscribe.
        let _again = conn.subscribe(Channel::Alerts);
        assert_eq!(registry.subscriber_count(&Channel::Alerts), 1);
    }

    #[tokio::test]
    async fn drop_disconnects() {
        let registry = Registry::new(8);
        let (conn, _rx) = registry.connect();
        let sub = conn.subscribe(Channel::Alerts);
        assert_eq!(registry.connection_count(), 1);

        drop(conn);
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.subscriber_count(&Channel::Alerts), 0);
        assert!(!sub.unsubscribe());
    }

    // -- Fan-out isolation -------------------------------------------------

    #[tokio::test]
    async fn closed_receiver_is_pruned_without_affecting_others() {
        let registry = Registry::new(8);
        let (dead, dead_rx) = registry.connect();
        let (live, mut live_rx) = registry.connect();
        let _s1 = dead.subscribe(Channel::AllSensorData);
        let _s2 = live.subscribe(Channel::AllSensorData);
        drop(dead_rx);

        let d = registry.publish(&Channel::AllSensorData, batch_event());
        assert_eq!(d.delivered, 1);
        assert_eq!(d.closed, 1);
        assert!(live_rx.try_recv().is_ok());
        assert_eq!(registry.connection_count(), 1);

        // The dead handle's drop is a no-op now.
        drop(dead);
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_stall_others() {
        let registry = Registry::new(2);
        let (slow, _slow_rx) = registry.connect(); // never drained
        let (fast, mut fast_rx) = registry.connect();
        let _s1 = slow.subscribe(Channel::AllSensorData);
        let _s2 = fast.subscribe(Channel::AllSensorData);

        let mut dropped = 0;
        for _ in 0..5 {
            let d = registry.publish(&Channel::AllSensorData, batch_event());
            dropped += d.dropped;
            assert!(fast_rx.try_recv().is_ok(), "fast subscriber missed an event");
        }
        assert_eq!(dropped, 3);
        // Slow subscriber stays connected; it just lost events.
        assert_eq!(registry.connection_count(), 2);
    }

    #[tokio::test]
    async fn close_ends_every_queue() {
        let registry = Registry::new(8);
        let (a, mut rx_a) = registry.connect();
        let (_b, mut rx_b) = registry.connect();
        let _s = a.subscribe(Channel::Alerts);

        assert_eq!(registry.close(), 2);
        assert_eq!(registry.connection_count(), 0);
        assert!(rx_a.recv().await.is_none());
        assert!(rx_b.recv().await.is_none());
        assert!(!a.send(Event::Error {
            message: "late".into()
        }));
    }

    #[tokio::test]
    async fn direct_send_reaches_only_that_connection() {
        let registry = Registry::new(8);
        let (a, mut rx_a) = registry.connect();
        let (_b, mut rx_b) = registry.connect();
        assert!(a.send(Event::Subscribed {
            channel: Channel::Alerts
        }));
        assert!(matches!(rx_a.try_recv(), Ok(Event::Subscribed { .. })));
        assert!(rx_b.try_recv().is_err());
    }
}
