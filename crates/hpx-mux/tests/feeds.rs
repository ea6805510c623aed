//! Ready-made feed helpers against an in-memory connector.

mod common;

use std::sync::Arc;

use common::{MockConnector, manager, settle};
use hpx_mux::{
    EventsChannelOptions, ManagerConfig, MetricsOptions, NoCredentials, SharedFeed, StaticToken,
    subscribe_events_channel, subscribe_metrics,
};
use parking_lot::Mutex;
use serde_json::{Value, json};

#[tokio::test(start_paused = true)]
async fn test_events_channel_subscribes_and_tracks_connection() {
    let connector = MockConnector::new();
    let manager = manager(ManagerConfig::default(), &connector, NoCredentials);
    let received: Arc<Mutex<Vec<Value>>> = Arc::default();
    let status: Arc<Mutex<Vec<bool>>> = Arc::default();

    let sink = Arc::clone(&received);
    let seen = Arc::clone(&status);
    let feed = subscribe_events_channel(
        &manager,
        EventsChannelOptions::new("vm-events", "vm-list")
            .on_connection_change(move |connected| seen.lock().push(connected)),
        move |payload, _| sink.lock().push(payload.clone()),
    );
    settle().await;

    let socket = connector.socket(0);
    let subscribe = json!({"type": "subscribe", "payload": {"channel": "vm-events"}});
    assert_eq!(socket.written_json(), [subscribe.clone(), subscribe]);

    socket.push_json(json!({"type": "event", "payload": {"vm": "a", "state": "running"}}));
    socket.push_json(json!({"type": "notice", "payload": {"ignored": true}}));
    settle().await;
    assert_eq!(
        *received.lock(),
        [json!({"vm": "a", "state": "running"})]
    );

    socket.fail("reset");
    settle().await;
    assert_eq!(status.lock().first(), Some(&false));
    assert!(status.lock().contains(&true));
    assert_eq!(status.lock().last(), Some(&false));

    feed.unsubscribe();
    settle().await;
    assert_eq!(
        manager.subscriber_count(&SharedFeed::Events.connection_id()),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_events_channel_resubscribes_after_reconnect() {
    let connector = MockConnector::new();
    let manager = manager(ManagerConfig::default(), &connector, NoCredentials);

    let _feed = subscribe_events_channel(
        &manager,
        EventsChannelOptions::new("alerts", "alert-panel"),
        |_, _| {},
    );
    settle().await;

    manager.reconnect(&SharedFeed::Events.connection_id());
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    assert_eq!(connector.dial_count(), 2);
    assert_eq!(
        connector.socket(1).written_json(),
        [json!({"type": "subscribe", "payload": {"channel": "alerts"}})]
    );
}

#[tokio::test(start_paused = true)]
async fn test_metrics_subscribes_after_auth_ack() {
    let connector = MockConnector::new();
    let manager = manager(ManagerConfig::default(), &connector, StaticToken::new("tok"));
    let samples: Arc<Mutex<Vec<Value>>> = Arc::default();

    let sink = Arc::clone(&samples);
    let _feed = subscribe_metrics(&manager, MetricsOptions::new("dashboard"), move |data| {
        sink.lock().push(data.clone())
    });
    settle().await;

    let socket = connector.socket(0);
    assert_eq!(
        socket.written_json(),
        [json!({"type": "auth", "payload": {"token": "tok"}})]
    );

    socket.push_json(json!({"type": "auth", "payload": {"authenticated": true}}));
    socket.push_json(json!({"type": "data"}));
    socket.push_json(json!({"type": "data", "payload": {"cpu": 0.4}}));
    settle().await;

    assert_eq!(
        socket.written_json()[1],
        json!({"type": "subscribe"})
    );
    assert_eq!(*samples.lock(), [json!({"cpu": 0.4})]);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_auth_does_not_subscribe() {
    let connector = MockConnector::new();
    let manager = manager(ManagerConfig::default(), &connector, StaticToken::new("tok"));

    let _feed = subscribe_metrics(&manager, MetricsOptions::new("dashboard"), |_| {});
    settle().await;

    let socket = connector.socket(0);
    socket.push_json(json!({"type": "auth", "payload": {"authenticated": false}}));
    settle().await;

    assert_eq!(socket.written().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_metrics_error_frame_marks_feed_disconnected() {
    let connector = MockConnector::new();
    let manager = manager(ManagerConfig::default(), &connector, StaticToken::new("tok"));
    let status: Arc<Mutex<Vec<bool>>> = Arc::default();
    let samples: Arc<Mutex<Vec<Value>>> = Arc::default();

    let seen = Arc::clone(&status);
    let sink = Arc::clone(&samples);
    let _feed = subscribe_metrics(
        &manager,
        MetricsOptions::new("dashboard")
            .on_connection_change(move |connected| seen.lock().push(connected)),
        move |data| sink.lock().push(data.clone()),
    );
    settle().await;

    let socket = connector.socket(0);
    socket.push_json(json!({"type": "auth", "payload": {"authenticated": true}}));
    socket.push_json(json!({"type": "error", "payload": {"message": "metrics unavailable"}}));
    settle().await;

    assert_eq!(*status.lock(), [true, false]);
    assert!(samples.lock().is_empty());
    assert_eq!(
        manager.subscriber_count(&SharedFeed::Metrics.connection_id()),
        1
    );

    socket.fail("reset");
    settle().await;
    assert_eq!(status.lock().last(), Some(&false));
    assert!(status.lock().len() > 2);
}
