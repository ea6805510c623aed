//! Connection identity: feeds, session kinds and the `ConnectionId` key.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TransportError;

/// Broadcast feeds served by a single shared socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SharedFeed {
    /// Host metrics stream.
    Metrics,
    /// Resource event stream.
    Events,
    /// User notifications.
    Notifications,
}

impl SharedFeed {
    /// Every shared feed.
    pub const ALL: [SharedFeed; 3] = [Self::Metrics, Self::Events, Self::Notifications];

    /// Feed name as it appears in a connection id.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::Events => "events",
            Self::Notifications => "notifications",
        }
    }

    /// Endpoint path this feed connects to.
    pub fn endpoint_path(&self) -> &'static str {
        match self {
            Self::Metrics => "/ws/metrics",
            Self::Events => "/ws/events",
            Self::Notifications => "/ws/notifications",
        }
    }

    /// The connection id for this feed.
    pub fn connection_id(self) -> ConnectionId {
        ConnectionId::Shared(self)
    }
}

impl fmt::Display for SharedFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SharedFeed {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|feed| feed.as_str() == s)
            .ok_or_else(|| TransportError::InvalidConnectionId {
                value: format!("shared:{s}"),
            })
    }
}

/// Kinds of per-session sockets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IsolatedKind {
    /// Interactive terminal session.
    Terminals,
    /// File upload / download.
    FileTransfers,
    /// Playbook or command execution output.
    Executions,
    /// Container log tail.
    ContainerLogs,
}

impl IsolatedKind {
    /// Every isolated kind.
    pub const ALL: [IsolatedKind; 4] = [
        Self::Terminals,
        Self::FileTransfers,
        Self::Executions,
        Self::ContainerLogs,
    ];

    /// Kind name as it appears in a connection id.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminals => "terminals",
            Self::FileTransfers => "fileTransfers",
            Self::Executions => "executions",
            Self::ContainerLogs => "containerLogs",
        }
    }

    fn base_path(&self) -> &'static str {
        match self {
            Self::Terminals => "/ws/terminal",
            Self::FileTransfers => "/ws/upload",
            Self::Executions => "/ws/ansible-exec",
            Self::ContainerLogs => "/ws/container/logs",
        }
    }

    /// Endpoint path for one session, with the instance id as `?id=`.
    pub fn endpoint_path(&self, instance: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(instance.as_bytes()).collect();
        format!("{}?id={encoded}", self.base_path())
    }

    /// Name of the reconnect policy this kind uses.
    pub fn policy_key(&self) -> &'static str {
        match self {
            Self::Terminals => "terminal",
            other => other.as_str(),
        }
    }

    /// Whether sessions of this kind are held open long enough to need
    /// health monitoring.
    pub fn is_long_lived(&self) -> bool {
        matches!(self, Self::Terminals | Self::Executions)
    }
}

impl fmt::Display for IsolatedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolatedKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| TransportError::InvalidConnectionId {
                value: format!("isolated:{s}"),
            })
    }
}

/// Registry key for one logical connection.
///
/// Renders as `shared:<feed>` or `isolated:<kind>:<instance>`. At most one
/// live socket exists per id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionId {
    /// A broadcast feed.
    Shared(SharedFeed),
    /// A per-session socket.
    Isolated {
        /// Session kind.
        kind: IsolatedKind,
        /// Caller-chosen instance id.
        instance: String,
    },
}

impl ConnectionId {
    /// Build an isolated id.
    pub fn isolated(kind: IsolatedKind, instance: impl Into<String>) -> Self {
        Self::Isolated {
            kind,
            instance: instance.into(),
        }
    }

    /// Returns true for `shared:*` ids.
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    /// Returns the feed for a shared id.
    pub fn shared_feed(&self) -> Option<SharedFeed> {
        match self {
            Self::Shared(feed) => Some(*feed),
            Self::Isolated { .. } => None,
        }
    }

    /// Endpoint path (before URL resolution).
    pub fn endpoint_path(&self) -> String {
        match self {
            Self::Shared(feed) => feed.endpoint_path().to_string(),
            Self::Isolated { kind, instance } => kind.endpoint_path(instance),
        }
    }

    /// Name of the reconnect policy for this connection.
    pub fn policy_key(&self) -> &'static str {
        match self {
            Self::Shared(feed) => feed.as_str(),
            Self::Isolated { kind, .. } => kind.policy_key(),
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared(feed) => write!(f, "shared:{feed}"),
            Self::Isolated { kind, instance } => write!(f, "isolated:{kind}:{instance}"),
        }
    }
}

impl FromStr for ConnectionId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidConnectionId {
            value: s.to_string(),
        };

        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("shared"), Some(feed), None) => Ok(Self::Shared(feed.parse()?)),
            (Some("isolated"), Some(kind), Some(instance)) if !instance.is_empty() => {
                Ok(Self::isolated(kind.parse()?, instance))
            }
            _ => Err(invalid()),
        }
    }
}

impl From<SharedFeed> for ConnectionId {
    fn from(feed: SharedFeed) -> Self {
        Self::Shared(feed)
    }
}

impl Serialize for ConnectionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConnectionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
