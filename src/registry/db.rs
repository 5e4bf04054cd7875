//! SQLite-backed registry of nodes, subscribers, audit entries and notifications.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};

use crate::registry::types::{
    AuditEntry, Node, NodeId, NodeSpec, NodeUpdate, Notification, NotificationKind,
    RegistryError, RegistryResult, Role, Subscriber, SubscriberId, SubscriberRecord,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    name         TEXT NOT NULL UNIQUE,
    address      TEXT NOT NULL,
    port         INTEGER NOT NULL,
    protocol     TEXT NOT NULL,
    api_port     INTEGER NOT NULL,
    is_connected INTEGER NOT NULL DEFAULT 0,
    last_checked TEXT
);

CREATE TABLE IF NOT EXISTS subscribers (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    username         TEXT NOT NULL UNIQUE,
    credential       TEXT NOT NULL UNIQUE,
    role             TEXT NOT NULL DEFAULT 'user',
    traffic_limit_gb INTEGER NOT NULL DEFAULT 0,
    traffic_used_gb  INTEGER NOT NULL DEFAULT 0,
    expiry           TEXT,
    is_active        INTEGER NOT NULL DEFAULT 1,
    is_online        INTEGER NOT NULL DEFAULT 0,
    node_id          INTEGER REFERENCES nodes(id) ON DELETE SET NULL
);
CREATE INDEX IF NOT EXISTS idx_subscribers_node ON subscribers(node_id);

-- No foreign key: audit history outlives the subscriber row.
CREATE TABLE IF NOT EXISTS audit_log (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    subscriber_id INTEGER,
    actor         TEXT NOT NULL,
    action        TEXT NOT NULL,
    timestamp     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS notifications (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    subscriber_id INTEGER NOT NULL REFERENCES subscribers(id) ON DELETE CASCADE,
    kind          TEXT NOT NULL,
    message       TEXT NOT NULL,
    is_read       INTEGER NOT NULL DEFAULT 0,
    timestamp     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_notifications_subscriber ON notifications(subscriber_id, kind);
"#;

const NODE_COLUMNS: &str =
    "id, name, address, port, protocol, api_port, is_connected, last_checked";

const SUBSCRIBER_COLUMNS: &str = "id, username, credential, role, traffic_limit_gb, \
     traffic_used_gb, expiry, is_active, is_online, node_id";

/// Shared handle to the relational registry.
///
/// The connection mutex is only held for the duration of a synchronous
/// statement or transaction and never across an `.await`.
pub struct Registry {
    conn: Mutex<Connection>,
}

impl Registry {
    /// Open (creating if needed) the registry database at `path`.
    pub fn open(path: &Path) -> RegistryResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "Registry opened");
        Self::init(conn)
    }

    /// Open a private in-memory registry.
    pub fn open_in_memory() -> RegistryResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> RegistryResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // --- Nodes ---

    pub fn insert_node(&self, spec: &NodeSpec) -> RegistryResult<Node> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO nodes (name, address, port, protocol, api_port) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![spec.name, spec.address, spec.port, spec.protocol, spec.api_port],
        )
        .map_err(|e| conflict(e, format!("node name '{}' already exists", spec.name)))?;
        let id = conn.last_insert_rowid();
        query_node(&conn, id)?.ok_or_else(|| not_found("node", id))
    }

    pub fn update_node(&self, id: NodeId, update: &NodeUpdate) -> RegistryResult<Node> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE nodes SET address = ?2, port = ?3, protocol = ?4, api_port = ?5 WHERE id = ?1",
            params![id, update.address, update.port, update.protocol, update.api_port],
        )?;
        if changed == 0 {
            return Err(not_found("node", id));
        }
        query_node(&conn, id)?.ok_or_else(|| not_found("node", id))
    }

    pub fn node(&self, id: NodeId) -> RegistryResult<Option<Node>> {
        let conn = self.conn.lock();
        query_node(&conn, id)
    }

    pub fn require_node(&self, id: NodeId) -> RegistryResult<Node> {
        self.node(id)?.ok_or_else(|| not_found("node", id))
    }

    pub fn nodes(&self) -> RegistryResult<Vec<Node>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY id"))?;
        let rows = stmt.query_map([], node_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Record the outcome of a reachability probe.
    pub fn record_reachability(
        &self,
        id: NodeId,
        reachable: bool,
        checked_at: DateTime<Utc>,
    ) -> RegistryResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE nodes SET is_connected = ?2, last_checked = ?3 WHERE id = ?1",
            params![id, reachable, checked_at],
        )?;
        if changed == 0 {
            return Err(not_found("node", id));
        }
        Ok(())
    }

    // --- Subscribers ---

    pub fn insert_subscriber(&self, record: &SubscriberRecord) -> RegistryResult<Subscriber> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO subscribers (username, credential, role, traffic_limit_gb, expiry, node_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.username,
                record.credential,
                record.role,
                to_db_gb(record.traffic_limit_gb),
                record.expiry,
                record.node_id,
            ],
        )
        .map_err(|e| conflict(e, format!("username '{}' already exists", record.username)))?;
        let id = conn.last_insert_rowid();
        query_subscriber(&conn, "id = ?1", params![id])?.ok_or_else(|| not_found("subscriber", id))
    }

    pub fn subscriber(&self, id: SubscriberId) -> RegistryResult<Option<Subscriber>> {
        let conn = self.conn.lock();
        query_subscriber(&conn, "id = ?1", params![id])
    }

    pub fn subscriber_by_username(&self, username: &str) -> RegistryResult<Option<Subscriber>> {
        let conn = self.conn.lock();
        query_subscriber(&conn, "username = ?1", params![username])
    }

    pub fn delete_subscriber(&self, id: SubscriberId) -> RegistryResult<bool> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM subscribers WHERE id = ?1", params![id])? > 0)
    }

    /// Every record, administrative ones included.
    pub fn subscribers(&self) -> RegistryResult<Vec<Subscriber>> {
        self.select_subscribers("1 = 1", params![])
    }

    /// Non-administrative records, the population the control loops act on.
    pub fn managed_subscribers(&self) -> RegistryResult<Vec<Subscriber>> {
        self.select_subscribers("role = ?1", params![Role::Subscriber])
    }

    /// Non-administrative records assigned to `node_id`.
    pub fn subscribers_on_node(&self, node_id: NodeId) -> RegistryResult<Vec<Subscriber>> {
        self.select_subscribers("role = ?1 AND node_id = ?2", params![Role::Subscriber, node_id])
    }

    fn select_subscribers(
        &self,
        filter: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> RegistryResult<Vec<Subscriber>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE {filter} ORDER BY id"
        ))?;
        let rows = stmt.query_map(params, subscriber_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn set_active(&self, id: SubscriberId, active: bool) -> RegistryResult<()> {
        self.update_subscriber(id, "is_active = ?2", params![id, active])
    }

    pub fn set_traffic_used(&self, id: SubscriberId, used_gb: u64) -> RegistryResult<()> {
        self.update_subscriber(id, "traffic_used_gb = ?2", params![id, to_db_gb(used_gb)])
    }

    pub fn renew(
        &self,
        id: SubscriberId,
        traffic_limit_gb: u64,
        expiry: DateTime<Utc>,
    ) -> RegistryResult<()> {
        self.update_subscriber(
            id,
            "traffic_limit_gb = ?2, expiry = ?3",
            params![id, to_db_gb(traffic_limit_gb), expiry],
        )
    }

    /// Apply a batch of online-flag observations in one transaction.
    pub fn set_online_many(&self, updates: &[(SubscriberId, bool)]) -> RegistryResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE subscribers SET is_online = ?2 WHERE id = ?1")?;
            for (id, online) in updates {
                stmt.execute(params![id, online])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn update_subscriber(
        &self,
        id: SubscriberId,
        assignments: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> RegistryResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            &format!("UPDATE subscribers SET {assignments} WHERE id = ?1"),
            params,
        )?;
        if changed == 0 {
            return Err(not_found("subscriber", id));
        }
        Ok(())
    }

    /// Flip the active flag off, append the audit entry and queue the
    /// notification in a single transaction.
    ///
    /// Returns `false` without writing anything when the subscriber was
    /// already inactive, so racing enforcement passes record it once.
    pub fn deactivate(
        &self,
        id: SubscriberId,
        actor: &str,
        action: &str,
        message: &str,
    ) -> RegistryResult<bool> {
        let now = Utc::now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE subscribers SET is_active = 0, is_online = 0 WHERE id = ?1 AND is_active = 1",
            params![id],
        )?;
        if changed == 0 {
            let exists = tx
                .query_row("SELECT 1 FROM subscribers WHERE id = ?1", params![id], |_| Ok(()))
                .optional()?
                .is_some();
            return if exists {
                Ok(false)
            } else {
                Err(not_found("subscriber", id))
            };
        }
        tx.execute(
            "INSERT INTO audit_log (subscriber_id, actor, action, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![id, actor, action, now],
        )?;
        tx.execute(
            "INSERT INTO notifications (subscriber_id, kind, message, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![id, NotificationKind::Deactivated, message, now],
        )?;
        tx.commit()?;
        Ok(true)
    }

    // --- Audit log & notifications ---

    pub fn append_audit(
        &self,
        subscriber_id: Option<SubscriberId>,
        actor: &str,
        action: &str,
    ) -> RegistryResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_log (subscriber_id, actor, action, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![subscriber_id, actor, action, Utc::now()],
        )?;
        Ok(())
    }

    pub fn audit_entries(&self, subscriber_id: SubscriberId) -> RegistryResult<Vec<AuditEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, subscriber_id, actor, action, timestamp FROM audit_log \
             WHERE subscriber_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![subscriber_id], |row| {
            Ok(AuditEntry {
                id: row.get(0)?,
                subscriber_id: row.get(1)?,
                actor: row.get(2)?,
                action: row.get(3)?,
                timestamp: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn notify(
        &self,
        subscriber_id: SubscriberId,
        kind: NotificationKind,
        message: &str,
    ) -> RegistryResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO notifications (subscriber_id, kind, message, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![subscriber_id, kind, message, Utc::now()],
        )?;
        Ok(())
    }

    pub fn notifications(&self, subscriber_id: SubscriberId) -> RegistryResult<Vec<Notification>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, subscriber_id, kind, message, is_read, timestamp FROM notifications \
             WHERE subscriber_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![subscriber_id], |row| {
            Ok(Notification {
                id: row.get(0)?,
                subscriber_id: row.get(1)?,
                kind: row.get(2)?,
                message: row.get(3)?,
                is_read: row.get(4)?,
                timestamp: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn has_notification_since(
        &self,
        subscriber_id: SubscriberId,
        kind: NotificationKind,
        since: DateTime<Utc>,
    ) -> RegistryResult<bool> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM notifications WHERE subscriber_id = ?1 AND kind = ?2 AND timestamp >= ?3 LIMIT 1",
                params![subscriber_id, kind, since],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

fn query_node(conn: &Connection, id: NodeId) -> RegistryResult<Option<Node>> {
    Ok(conn
        .query_row(
            &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
            params![id],
            node_from_row,
        )
        .optional()?)
}

fn query_subscriber(
    conn: &Connection,
    filter: &str,
    params: &[&dyn rusqlite::ToSql],
) -> RegistryResult<Option<Subscriber>> {
    Ok(conn
        .query_row(
            &format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE {filter}"),
            params,
            subscriber_from_row,
        )
        .optional()?)
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        port: row.get(3)?,
        protocol: row.get(4)?,
        api_port: row.get(5)?,
        is_connected: row.get(6)?,
        last_checked: row.get(7)?,
    })
}

fn subscriber_from_row(row: &Row<'_>) -> rusqlite::Result<Subscriber> {
    Ok(Subscriber {
        id: row.get(0)?,
        username: row.get(1)?,
        credential: row.get(2)?,
        role: row.get(3)?,
        traffic_limit_gb: from_db_gb(row.get(4)?),
        traffic_used_gb: from_db_gb(row.get(5)?),
        expiry: row.get(6)?,
        is_active: row.get(7)?,
        is_online: row.get(8)?,
        node_id: row.get(9)?,
    })
}

fn to_db_gb(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db_gb(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn not_found(entity: &'static str, key: impl ToString) -> RegistryError {
    RegistryError::NotFound {
        entity,
        key: key.to_string(),
    }
}

fn conflict(err: rusqlite::Error, message: String) -> RegistryError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            RegistryError::Conflict(message)
        }
        _ => RegistryError::Sqlite(err),
    }
}
