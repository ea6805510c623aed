//! # hpx-mux
//!
//! Multiplexed real-time feeds over WebSocket connections.
//!
//! One [`ConnectionManager`] owns every socket a session needs. Broadcast
//! feeds (metrics, events, notifications) share one socket per feed,
//! reference-counted by attached routers. Interactive sessions (terminals,
//! transfers, executions, log tails) each get an isolated socket keyed by
//! kind and instance id.
//!
//! ## Features
//!
//! - **Shared and isolated connections**: at most one socket per
//!   [`ConnectionId`]; shared sockets close when their last router leaves
//! - **Reconnection**: per-type [`ReconnectPolicy`] with exponential backoff
//!   and jitter; normal closes are never retried
//! - **Routing**: independent [`Router`]s with type and predicate filters;
//!   a failing router never affects its siblings
//! - **Buffering**: bounded per-connection outbound queue flushed in order
//!   right after the post-open `auth` frame
//! - **Health monitoring**: periodic `ping` and forced reconnect of silent
//!   long-lived connections
//! - **Observability**: typed [`TransportEvent`]s via listeners or a
//!   broadcast stream, plus a watchable [`ConnectionHealthSummary`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hpx_mux::{
//!     BaseUrl, ConnectionManager, IsolatedKind, IsolatedOptions, ManagerConfig, Router,
//!     SharedFeed, StaticToken,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ConnectionManager::new(
//!         ManagerConfig::default(),
//!         BaseUrl::new("wss://console.example"),
//!         StaticToken::new("session-token"),
//!     )?;
//!
//!     let _events = manager.subscribe_shared(
//!         SharedFeed::Events,
//!         Router::new("audit-log", |frame| {
//!             println!("{}", frame.payload());
//!             Ok(())
//!         })
//!         .message_type("event"),
//!     );
//!
//!     let terminal =
//!         manager.open_isolated(IsolatedKind::Terminals, "vm-42", IsolatedOptions::new());
//!     terminal.send(serde_json::json!({"type": "input", "payload": "uptime\n"}));
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     manager.close_all();
//!     Ok(())
//! }
//! ```

pub mod collab;
pub mod config;
pub mod error;
pub mod events;
pub mod feeds;
pub mod frame;
pub mod health;
pub mod manager;
pub mod queue;
pub mod reconnect;
pub mod router;
pub mod socket;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use collab::{BaseUrl, CredentialProvider, NoCredentials, StaticToken, UrlResolver};
pub use config::ManagerConfig;
pub use error::{TransportError, TransportResult};
pub use events::{EventBus, EventKind, ListenerGuard, TransportEvent};
pub use feeds::{
    EventsChannelOptions, FeedSubscription, MetricsOptions, subscribe_events_channel,
    subscribe_metrics,
};
pub use frame::{Frame, FrameBody, Inbound, Outbound};
pub use manager::{
    ConnectionManager, IsolatedConnection, IsolatedOptions, Subscription, WeakConnectionManager,
};
pub use queue::{OutboundQueue, QueuedMessage};
pub use reconnect::{ReconnectPolicies, ReconnectPolicy, calculate_backoff};
pub use router::{DispatchReport, Router, RouterTable, TypeFilter};
pub use socket::{
    Connector, SocketInput, SocketParts, SocketReader, SocketRequest, SocketWriter,
    TungsteniteConnector,
};
pub use state::{ConnectionHealth, ConnectionHealthSummary, ConnectionState, ConnectionStatus};
pub use types::{ConnectionId, IsolatedKind, SharedFeed};
