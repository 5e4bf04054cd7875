//! Active session discovery from per-user traffic counters.

use std::collections::HashSet;
use std::sync::Arc;

use crate::observability::metrics;
use crate::registry::{NodeId, Registry};
use crate::stats::proto::Stat;
use crate::stats::StatsClient;

const USER_PATTERN: &str = "user>>>";
const UPLINK_SUFFIX: &str = "traffic>>>uplink";

pub struct SessionTracker {
    registry: Arc<Registry>,
    client: Arc<dyn StatsClient>,
}

impl SessionTracker {
    pub fn new(registry: Arc<Registry>, client: Arc<dyn StatsClient>) -> Self {
        Self { registry, client }
    }

    /// Credentials with a live uplink counter on the node.
    ///
    /// Returns the empty set for unknown nodes, nodes last observed as
    /// unreachable (without contacting them), and on any RPC failure.
    pub async fn active_credentials(&self, node_id: NodeId) -> HashSet<String> {
        let node = match self.registry.node(node_id) {
            Ok(Some(node)) => node,
            Ok(None) => return HashSet::new(),
            Err(e) => {
                tracing::warn!(node = node_id, error = %e, "Failed to load node for session query");
                return HashSet::new();
            }
        };
        if !node.is_connected {
            tracing::debug!(node = node_id, "Node cached as unreachable, skipping session query");
            return HashSet::new();
        }

        match self.client.query_stats(&node, USER_PATTERN).await {
            Ok(stats) => {
                let active = credentials_from_stats(&stats);
                metrics::set_active_sessions(node_id, active.len());
                active
            }
            Err(e) => {
                tracing::warn!(node = node_id, error = %e, "Session query failed");
                HashSet::new()
            }
        }
    }
}

/// Extract `{credential}` from counters named `user>>>{credential}>>>traffic>>>uplink`.
pub fn credentials_from_stats(stats: &[Stat]) -> HashSet<String> {
    stats
        .iter()
        .filter(|stat| stat.name.ends_with(UPLINK_SUFFIX))
        .filter_map(|stat| {
            let mut parts = stat.name.split(">>>");
            match (parts.next(), parts.next()) {
                (Some("user"), Some(credential)) if !credential.is_empty() => {
                    Some(credential.to_string())
                }
                _ => None,
            }
        })
        .collect()
}
