//! Ready-made subscriptions for the shared feeds.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::{
    events::{EventKind, ListenerGuard},
    frame::{Frame, FrameBody},
    manager::{ConnectionManager, Subscription},
    router::Router,
    types::SharedFeed,
};

/// A feed subscription plus the listener that keeps it in sync with the
/// socket. Dropping it detaches both.
#[must_use = "dropping the subscription detaches it immediately"]
#[derive(Debug)]
pub struct FeedSubscription {
    subscription: Subscription,
    listener: Option<ListenerGuard>,
}

impl FeedSubscription {
    /// Detach now.
    pub fn unsubscribe(self) {
        let Self {
            subscription,
            listener,
        } = self;
        drop(listener);
        subscription.unsubscribe();
    }
}

type ConnectionChangeFn = dyn Fn(bool) + Send + Sync;

/// Options for [`subscribe_events_channel`].
pub struct EventsChannelOptions {
    /// Channel name sent in the `subscribe` frame (e.g. `vm-events`).
    pub channel: String,
    /// Route id of the attached router.
    pub route_id: String,
    on_connection_change: Option<Arc<ConnectionChangeFn>>,
}

impl EventsChannelOptions {
    /// Subscribe to `channel` under `route_id`.
    pub fn new(channel: impl Into<String>, route_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            route_id: route_id.into(),
            on_connection_change: None,
        }
    }

    /// Be told whenever the events socket goes up or down.
    #[must_use]
    pub fn on_connection_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.on_connection_change = Some(Arc::new(callback));
        self
    }
}

/// Listen to one channel of the shared `events` feed.
///
/// `on_event` receives the payload of every `event` frame. A `subscribe`
/// frame for the channel is sent immediately (queued until the socket
/// opens) and again after every reconnect.
pub fn subscribe_events_channel<F>(
    manager: &ConnectionManager,
    options: EventsChannelOptions,
    on_event: F,
) -> FeedSubscription
where
    F: Fn(&Value, &Frame) + Send + Sync + 'static,
{
    let id = SharedFeed::Events.connection_id();
    let channel = Some(options.channel);

    let router = Router::new(options.route_id, move |frame| {
        on_event(&frame.payload(), frame);
        Ok(())
    })
    .message_type("event");
    let subscription = manager.subscribe_shared(SharedFeed::Events, router);

    manager.send(&id, Frame::subscribe(channel.clone()));

    if let Some(callback) = &options.on_connection_change {
        let connected = manager
            .connection_state(&id)
            .is_some_and(|state| state.status.is_connected());
        callback(connected);
    }

    let weak = manager.downgrade();
    let on_change = options.on_connection_change;
    let listener = manager.on_any(move |event| {
        if event.connection_id != id {
            return;
        }
        match event.kind {
            EventKind::Connected => {
                if let Some(callback) = &on_change {
                    callback(true);
                }
                if let Some(manager) = weak.upgrade() {
                    manager.send(&id, Frame::subscribe(channel.clone()));
                }
            }
            EventKind::Disconnected | EventKind::Error | EventKind::Reconnecting => {
                if let Some(callback) = &on_change {
                    callback(false);
                }
            }
            _ => {}
        }
    });

    FeedSubscription {
        subscription,
        listener: Some(listener),
    }
}

/// Options for [`subscribe_metrics`].
pub struct MetricsOptions {
    /// Route id of the attached router.
    pub route_id: String,
    on_connection_change: Option<Arc<ConnectionChangeFn>>,
}

impl MetricsOptions {
    /// Attach under `route_id`.
    pub fn new(route_id: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            on_connection_change: None,
        }
    }

    /// Be told when the feed becomes usable or stops being usable.
    #[must_use]
    pub fn on_connection_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.on_connection_change = Some(Arc::new(callback));
        self
    }
}

/// Listen to the shared `metrics` feed.
///
/// `on_data` receives the payload of every `data` frame. When the server
/// acknowledges authentication the feed subscription is requested and the
/// feed counts as connected. An `error` frame, or the socket going down,
/// marks it disconnected.
pub fn subscribe_metrics<F>(
    manager: &ConnectionManager,
    options: MetricsOptions,
    on_data: F,
) -> FeedSubscription
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    let id = SharedFeed::Metrics.connection_id();
    let weak = manager.downgrade();
    let on_change = options.on_connection_change;

    let report = on_change.clone();
    let target = id.clone();
    let router = Router::new(options.route_id, move |frame| {
        match &frame.body {
            FrameBody::Auth(auth) if auth.authenticated == Some(true) => {
                if let Some(manager) = weak.upgrade() {
                    manager.send(&target, Frame::subscribe(None));
                }
                if let Some(callback) = &report {
                    callback(true);
                }
            }
            FrameBody::Error(error) => {
                warn!(
                    connection_id = %target,
                    message = error.message.as_deref().unwrap_or_default(),
                    "Metrics feed reported an error"
                );
                if let Some(callback) = &report {
                    callback(false);
                }
            }
            _ if frame.kind() == "data" => {
                let payload = frame.payload();
                if !payload.is_null() {
                    on_data(&payload);
                }
            }
            _ => {}
        }
        Ok(())
    })
    .message_types(["auth", "data", "error"]);
    let subscription = manager.subscribe_shared(SharedFeed::Metrics, router);

    let listener = on_change.map(|callback| {
        manager.on_any(move |event| {
            if event.connection_id == id
                && matches!(
                    event.kind,
                    EventKind::Disconnected | EventKind::Error | EventKind::Reconnecting
                )
            {
                callback(false);
            }
        })
    });

    FeedSubscription {
        subscription,
        listener,
    }
}
