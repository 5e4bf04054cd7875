//! Usage accounting from node access logs.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;

use serde::Serialize;

use crate::document::{ConfigStore, StorageError};
use crate::observability::metrics;
use crate::provisioning::ProvisioningEngine;
use crate::registry::{Node, NodeId, Registry, RegistryError};
use crate::traffic::log_parser::parse_access_log;

#[derive(Debug, thiserror::Error)]
pub enum MeterError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Per-node outcome of one metering pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct MeterReport {
    pub node_id: NodeId,
    /// Subscribers whose stored usage was overwritten.
    pub updated: usize,
    /// Credentials removed from the document for exceeding their limit.
    pub pruned: Vec<String>,
    /// Set when pruning saved the document but the restart failed.
    pub restart_error: Option<String>,
}

pub struct TrafficMeter {
    registry: Arc<Registry>,
    store: ConfigStore,
    provisioning: Arc<ProvisioningEngine>,
}

impl TrafficMeter {
    pub fn new(
        registry: Arc<Registry>,
        store: ConfigStore,
        provisioning: Arc<ProvisioningEngine>,
    ) -> Self {
        Self {
            registry,
            store,
            provisioning,
        }
    }

    /// Whole gigabytes per credential found in the node's access log.
    /// A missing log measures nothing.
    pub fn measure(&self, node_id: NodeId) -> Result<HashMap<String, u64>, StorageError> {
        let path = self.store.access_log_path(node_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(source) => return Err(StorageError::Io { path, source }),
        };

        let totals = parse_access_log(BufReader::new(file))
            .map_err(|source| StorageError::Io { path: path.clone(), source })?;
        if totals.skipped > 0 {
            tracing::warn!(node = node_id, skipped = totals.skipped, "Skipped unreadable usage lines");
            metrics::record_skipped_log_lines(totals.skipped);
        }
        Ok(totals.gigabytes())
    }

    /// Overwrite stored usage with the measured totals, then drop every
    /// over-limit credential from the node in one batch.
    pub async fn reconcile_node(&self, node: &Node) -> Result<MeterReport, MeterError> {
        let measured = self.measure(node.id)?;
        let mut report = MeterReport {
            node_id: node.id,
            ..Default::default()
        };

        let mut over_limit = Vec::new();
        for mut sub in self.registry.subscribers_on_node(node.id)? {
            if let Some(&used) = measured.get(&sub.credential) {
                if used < sub.traffic_used_gb {
                    tracing::warn!(
                        node = node.id,
                        subscriber = %sub.username,
                        stored = sub.traffic_used_gb,
                        measured = used,
                        "Measured usage is below stored usage, log was likely rotated"
                    );
                    metrics::record_usage_regression();
                }
                if used != sub.traffic_used_gb {
                    self.registry.set_traffic_used(sub.id, used)?;
                    sub.traffic_used_gb = used;
                    report.updated += 1;
                }
            }
            if sub.is_traffic_exhausted() {
                over_limit.push(sub.credential);
            }
        }

        if !over_limit.is_empty() {
            let outcome = self.provisioning.prune_credentials(node, &over_limit).await?;
            if outcome.changed {
                report.pruned = over_limit;
            }
            report.restart_error = outcome.restart_error.map(|e| e.to_string());
        }

        tracing::info!(
            node = node.id,
            updated = report.updated,
            pruned = report.pruned.len(),
            "Traffic metering complete"
        );
        Ok(report)
    }

    /// Meter every node. A failure on one node does not stop the others.
    pub async fn run_cycle(&self) -> Vec<MeterReport> {
        let nodes = match self.registry.nodes() {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list nodes for metering");
                return Vec::new();
            }
        };

        let mut reports = Vec::with_capacity(nodes.len());
        for node in &nodes {
            match self.reconcile_node(node).await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!(node = node.id, error = %e, "Traffic metering failed"),
            }
        }
        reports
    }
}
