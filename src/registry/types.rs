//! Registry record types and error definitions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type NodeId = i64;
pub type SubscriberId = i64;

/// A remote host running one managed proxy process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub address: String,
    /// Traffic inbound port.
    pub port: u16,
    /// Proxy protocol tag of the traffic inbound (e.g. `vless`).
    pub protocol: String,
    /// Stats RPC port.
    pub api_port: u16,
    /// Last observed reachability. A cached observation, not live truth.
    pub is_connected: bool,
    pub last_checked: Option<DateTime<Utc>>,
}

/// Attributes supplied when registering a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

/// Mutable node attributes. Identity (id and name) never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub address: String,
    pub port: u16,
    pub protocol: String,
    pub api_port: u16,
}

impl From<&Node> for NodeUpdate {
    fn from(node: &Node) -> Self {
        Self {
            address: node.address.clone(),
            port: node.port,
            protocol: node.protocol.clone(),
            api_port: node.api_port,
        }
    }
}

fn default_port() -> u16 {
    12345
}

fn default_protocol() -> String {
    "vless".to_string()
}

fn default_api_port() -> u16 {
    54321
}

/// Account role. Only [`Role::Subscriber`] records are provisioned and enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(rename = "user")]
    Subscriber,
    Admin,
    #[serde(rename = "superadmin")]
    SuperAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Subscriber => "user",
            Role::Admin => "admin",
            Role::SuperAdmin => "superadmin",
        }
    }

    pub fn is_administrative(&self) -> bool {
        !matches!(self, Role::Subscriber)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::Subscriber),
            "admin" => Ok(Role::Admin),
            "superadmin" => Ok(Role::SuperAdmin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|_| FromSqlError::InvalidType)
    }
}

/// A subscriber record together with its usage policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub username: String,
    /// Opaque token provisioned into the node document as the client id.
    pub credential: String,
    pub role: Role,
    /// Traffic limit in GB, 0 means unlimited.
    pub traffic_limit_gb: u64,
    pub traffic_used_gb: u64,
    /// None means the subscription never expires.
    pub expiry: Option<DateTime<Utc>>,
    pub is_active: bool,
    /// Best-effort cache refreshed only by an explicit online check.
    pub is_online: bool,
    pub node_id: Option<NodeId>,
}

impl Subscriber {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }

    pub fn is_traffic_exhausted(&self) -> bool {
        self.traffic_limit_gb > 0 && self.traffic_used_gb >= self.traffic_limit_gb
    }
}

/// Attributes of a subscriber row about to be inserted.
#[derive(Debug, Clone)]
pub struct SubscriberRecord {
    pub username: String,
    pub credential: String,
    pub role: Role,
    pub traffic_limit_gb: u64,
    pub expiry: Option<DateTime<Utc>>,
    pub node_id: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub subscriber_id: Option<SubscriberId>,
    pub actor: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Welcome,
    Deactivated,
    ExpiryWarning,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Welcome => "welcome",
            NotificationKind::Deactivated => "deactivated",
            NotificationKind::ExpiryWarning => "expiry_warning",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "welcome" => Ok(NotificationKind::Welcome),
            "deactivated" => Ok(NotificationKind::Deactivated),
            "expiry_warning" => Ok(NotificationKind::ExpiryWarning),
            other => Err(format!("unknown notification kind '{other}'")),
        }
    }
}

impl ToSql for NotificationKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for NotificationKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|_| FromSqlError::InvalidType)
    }
}

/// A user-facing message queued for delivery by the notification layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: i64,
    pub subscriber_id: SubscriberId,
    pub kind: NotificationKind,
    pub message: String,
    pub is_read: bool,
    pub timestamp: DateTime<Utc>,
}

/// Errors raised by the relational registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("conflict: {0}")]
    Conflict(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn subscriber() -> Subscriber {
        Subscriber {
            id: 1,
            username: "alice".into(),
            credential: "abc".into(),
            role: Role::Subscriber,
            traffic_limit_gb: 0,
            traffic_used_gb: 0,
            expiry: None,
            is_active: true,
            is_online: false,
            node_id: None,
        }
    }

    #[test]
    fn test_role_round_trips_through_text() {
        for role in [Role::Subscriber, Role::Admin, Role::SuperAdmin] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("root".parse::<Role>().is_err());
        assert!(!Role::Subscriber.is_administrative());
        assert!(Role::Admin.is_administrative());
    }

    #[test]
    fn test_unlimited_traffic_never_exhausts() {
        let mut sub = subscriber();
        sub.traffic_used_gb = 1_000;
        assert!(!sub.is_traffic_exhausted());

        sub.traffic_limit_gb = 10;
        sub.traffic_used_gb = 10;
        assert!(sub.is_traffic_exhausted());
    }

    #[test]
    fn test_expiry_boundary_counts_as_expired() {
        let now = Utc::now();
        let mut sub = subscriber();
        assert!(!sub.is_expired_at(now));

        sub.expiry = Some(now);
        assert!(sub.is_expired_at(now));

        sub.expiry = Some(now + Duration::seconds(1));
        assert!(!sub.is_expired_at(now));
    }
}
