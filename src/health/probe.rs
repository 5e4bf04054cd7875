//! Reachability probing of node stats APIs.

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;

use crate::observability::metrics;
use crate::registry::{Node, NodeId, Registry};
use crate::stats::StatsClient;

pub struct HealthProbe {
    registry: Arc<Registry>,
    client: Arc<dyn StatsClient>,
}

impl HealthProbe {
    pub fn new(registry: Arc<Registry>, client: Arc<dyn StatsClient>) -> Self {
        Self { registry, client }
    }

    /// Probe one node and record the observation.
    ///
    /// Unknown nodes are unreachable. Registry failures while recording are
    /// logged and do not change the returned observation.
    pub async fn check_reachable(&self, node_id: NodeId) -> bool {
        match self.registry.node(node_id) {
            Ok(Some(node)) => self.probe(&node).await,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(node = node_id, error = %e, "Failed to load node for probe");
                false
            }
        }
    }

    async fn probe(&self, node: &Node) -> bool {
        let reachable = match self.client.connect(node).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    node = node.id,
                    address = %node.address,
                    api_port = node.api_port,
                    error = %e,
                    "Node stats API unreachable"
                );
                false
            }
        };

        if reachable != node.is_connected {
            tracing::info!(node = node.id, reachable, "Node reachability changed");
        }
        if let Err(e) = self.registry.record_reachability(node.id, reachable, Utc::now()) {
            tracing::error!(node = node.id, error = %e, "Failed to record reachability");
        }
        metrics::set_node_reachable(node.id, reachable);
        reachable
    }

    /// Probe every registered node concurrently.
    pub async fn check_all(&self) -> Vec<(NodeId, bool)> {
        let nodes = match self.registry.nodes() {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list nodes for health check");
                return Vec::new();
            }
        };

        let results = join_all(nodes.iter().map(|node| self.probe(node))).await;
        let observed: Vec<_> = nodes.iter().map(|n| n.id).zip(results).collect();
        let up = observed.iter().filter(|(_, ok)| *ok).count();
        tracing::info!(nodes = observed.len(), reachable = up, "Health check complete");
        observed
    }
}
