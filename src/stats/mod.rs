//! Node stats API subsystem.
//!
//! # Data Flow
//! ```text
//! HealthProbe ────→ StatsClient::connect ─────────┐
//! SessionTracker ─→ StatsClient::query_stats ─────┼─→ client.rs (tonic, bounded)
//!                   "user>>>" counters            │   → node api inbound
//!                                                 ┘
//! ```
//!
//! # Design Decisions
//! - Every call is bounded by the configured probe timeout
//! - Callers collapse failures into "unreachable" or "no sessions"

pub mod client;
pub mod proto;
pub mod sessions;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::registry::Node;

pub use client::GrpcStatsClient;
pub use proto::Stat;
pub use sessions::SessionTracker;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("stats API did not answer within {0:?}")]
    Timeout(Duration),

    #[error("stats API unreachable: {0}")]
    Unreachable(String),

    #[error("stats RPC failed: {0}")]
    Rpc(String),
}

#[async_trait]
pub trait StatsClient: Send + Sync {
    /// Establish a connection to the node's stats API.
    async fn connect(&self, node: &Node) -> Result<(), ProbeError>;

    /// Return every counter whose name contains `pattern`.
    async fn query_stats(&self, node: &Node, pattern: &str) -> Result<Vec<Stat>, ProbeError>;
}
