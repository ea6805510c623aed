/// Example client that follows the shared events and metrics feeds and
/// prints every health change for one minute.
///
/// `MUX_BASE_URL` (default `ws://127.0.0.1:8080`) and `MUX_TOKEN` select the
/// server and credentials.
use std::time::Duration;

use hpx_mux::{
    BaseUrl, ConnectionManager, EventKind, EventsChannelOptions, ManagerConfig, MetricsOptions,
    StaticToken, subscribe_events_channel, subscribe_metrics,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let base = std::env::var("MUX_BASE_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080".into());
    let token = std::env::var("MUX_TOKEN").unwrap_or_default();

    let manager = ConnectionManager::new(
        ManagerConfig::default(),
        BaseUrl::new(base),
        StaticToken::new(token),
    )?;

    let _reconnects = manager.on(EventKind::Reconnecting, |event| {
        tracing::warn!(connection_id = %event.connection_id, data = ?event.data, "Reconnecting");
    });

    let _events = subscribe_events_channel(
        &manager,
        EventsChannelOptions::new("vm-events", "example-events").on_connection_change(
            |connected| tracing::info!(connected, "Events feed connection changed"),
        ),
        |payload, _| tracing::info!(%payload, "Event"),
    );
    let _metrics = subscribe_metrics(
        &manager,
        MetricsOptions::new("example-metrics")
            .on_connection_change(|connected| tracing::info!(connected, "Metrics feed changed")),
        |data| tracing::info!(%data, "Metrics sample"),
    );

    let mut health = manager.watch_health();
    let deadline = tokio::time::sleep(Duration::from_secs(60));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            changed = health.changed() => {
                if changed.is_err() {
                    break;
                }
                let summary = health.borrow_and_update().clone();
                tracing::info!(active = summary.active, total = summary.total, "Health");
            }
        }
    }

    manager.close_all();
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
