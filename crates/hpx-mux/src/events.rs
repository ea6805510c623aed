//! Typed lifecycle events.
//!
//! Every transition the manager goes through is published once as a
//! [`TransportEvent`], both to synchronous listeners registered with
//! [`EventBus::on`] and to async consumers holding a
//! [`broadcast::Receiver`].

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Weak},
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::types::ConnectionId;

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Kind of lifecycle event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// Socket opened and the queue was flushed.
    Connected,
    /// Socket closed.
    Disconnected,
    /// A frame was decoded and dispatched.
    Message,
    /// Socket or handshake error.
    Error,
    /// A retry timer was armed.
    Reconnecting,
    /// The outbound queue evicted its oldest message.
    QueueFull,
    /// The reconnect policy ran out of attempts.
    ReconnectExhausted,
}

impl EventKind {
    /// Event name on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Message => "message",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
            Self::QueueFull => "queue-full",
            Self::ReconnectExhausted => "reconnect-exhausted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle transition.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEvent {
    /// What happened.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Which connection.
    pub connection_id: ConnectionId,
    /// Kind-specific data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error description, for `error` and `reconnect-exhausted`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
}

impl TransportEvent {
    /// Event without data.
    pub fn new(kind: EventKind, connection_id: ConnectionId) -> Self {
        Self {
            kind,
            connection_id,
            data: None,
            error: None,
            timestamp: unix_millis(),
        }
    }

    /// Attach data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach an error description.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

type ListenerFn = dyn Fn(&TransportEvent) + Send + Sync;

struct Listener {
    key: u64,
    kind: Option<EventKind>,
    callback: Arc<ListenerFn>,
}

#[derive(Default)]
struct Listeners {
    next_key: u64,
    entries: Vec<Listener>,
}

impl Listeners {
    fn remove(&mut self, key: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|l| l.key != key);
        self.entries.len() != before
    }
}

/// Event emitter owned by one manager.
pub struct EventBus {
    listeners: Arc<Mutex<Listeners>>,
    tx: broadcast::Sender<TransportEvent>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

impl EventBus {
    /// Create a bus whose broadcast channel buffers `capacity` events per
    /// lagging receiver.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: Arc::new(Mutex::new(Listeners::default())),
            tx,
        }
    }

    /// Call `listener` for every event of `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerGuard
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(listener))
    }

    /// Call `listener` for every event.
    pub fn on_any<F>(&self, listener: F) -> ListenerGuard
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    fn register(&self, kind: Option<EventKind>, callback: Arc<ListenerFn>) -> ListenerGuard {
        let mut listeners = self.listeners.lock();
        let key = listeners.next_key;
        listeners.next_key += 1;
        listeners.entries.push(Listener {
            key,
            kind,
            callback,
        });
        ListenerGuard {
            key,
            listeners: Arc::downgrade(&self.listeners),
            active: true,
        }
    }

    /// Receiver for every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.tx.subscribe()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }

    /// Publish an event to listeners and receivers.
    ///
    /// Listeners are called outside the lock; a panicking listener is
    /// logged and skipped.
    pub fn emit(&self, event: TransportEvent) {
        let callbacks: Vec<Arc<ListenerFn>> = {
            let listeners = self.listeners.lock();
            listeners
                .entries
                .iter()
                .filter(|l| l.kind.is_none_or(|k| k == event.kind))
                .map(|l| Arc::clone(&l.callback))
                .collect()
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                warn!(
                    kind = %event.kind,
                    connection_id = %event.connection_id,
                    "Event listener panicked"
                );
            }
        }

        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}

/// Removes its listener when dropped.
#[must_use = "dropping the guard removes the listener immediately"]
pub struct ListenerGuard {
    key: u64,
    listeners: Weak<Mutex<Listeners>>,
    active: bool,
}

impl fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("key", &self.key)
            .field("active", &self.active)
            .finish()
    }
}

impl ListenerGuard {
    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    /// Keep the listener for the lifetime of the bus.
    pub fn detach(mut self) {
        self.active = false;
    }

    fn remove(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().remove(self.key);
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::types::SharedFeed;

    fn event(kind: EventKind) -> TransportEvent {
        TransportEvent::new(kind, SharedFeed::Metrics.connection_id())
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let value = serde_json::to_value(
            event(EventKind::QueueFull).with_data(json!({"dropped": 1})),
        )
        .unwrap();
        assert_eq!(value["type"], "queue-full");
        assert_eq!(value["connectionId"], "shared:metrics");
        assert_eq!(value["data"]["dropped"], 1);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_on_filters_by_kind() {
        let bus = EventBus::new(8);
        let connected = Arc::new(AtomicUsize::new(0));
        let any = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&connected);
        let _g1 = bus.on(EventKind::Connected, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let a = Arc::clone(&any);
        let _g2 = bus.on_any(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(event(EventKind::Connected));
        bus.emit(event(EventKind::Disconnected));

        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(any.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_guard_drop_unsubscribes() {
        let bus = EventBus::new(8);
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let guard = bus.on(EventKind::Error, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(event(EventKind::Error));
        drop(guard);
        bus.emit(event(EventKind::Error));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_detached_listener_survives() {
        let bus = EventBus::new(8);
        bus.on_any(|_| {}).detach();
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = EventBus::new(8);
        let count = Arc::new(AtomicUsize::new(0));
        let _bad = bus.on_any(|_| panic!("listener bug"));
        let c = Arc::clone(&count);
        let _good = bus.on_any(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(event(EventKind::Message));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_receiver_sees_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(event(EventKind::Reconnecting).with_data(json!({"attempt": 1})));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, EventKind::Reconnecting);
        assert_eq!(received.data, Some(json!({"attempt": 1})));
    }
}
