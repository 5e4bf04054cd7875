//! Relational registry subsystem.
//!
//! # Data Flow
//! ```text
//! Consumer operations (service) ──┐
//! EnforcementLoop / TrafficMeter ─┼─→ db.rs (Registry, one SQLite connection)
//! HealthProbe / SessionTracker ───┘        → nodes, subscribers,
//!                                            audit_log, notifications
//! ```
//!
//! # Design Decisions
//! - Relational state is committed before any document or process side effect
//! - The registry and the node documents are two replicas reconciled by the
//!   control loops, never written in one transaction
//! - Deactivation, its audit entry and its notification commit together

pub mod db;
pub mod types;

pub use db::Registry;
pub use types::{
    AuditEntry, Node, NodeId, NodeSpec, NodeUpdate, Notification, NotificationKind,
    RegistryError, RegistryResult, Role, Subscriber, SubscriberId, SubscriberRecord,
};
