//! Proxy process supervision subsystem.
//!
//! # Data Flow
//! ```text
//! ProvisioningEngine / ControlPlane
//!     → ProcessSupervisor::restart(node)     (serialized per node)
//!     → ProcessController::stop → start      (local.rs: pid file + signals)
//! ```
//!
//! # Design Decisions
//! - A restart is the only way the proxy picks up a new document
//! - Restart failure is reported to the caller, never rolled back
//! - Stop of a process that is not running succeeds

pub mod local;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::document::ConfigStore;
use crate::observability::metrics;
use crate::registry::{Node, NodeId};

pub use local::LocalProcessController;

#[derive(Debug, Error)]
pub enum SupervisionError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pid {pid} did not exit after SIGKILL")]
    StopTimeout { pid: u32 },
}

/// Starts and stops the proxy process of one node.
#[async_trait]
pub trait ProcessController: Send + Sync {
    /// Start the process reading `config_path`. Returns its pid.
    async fn start(&self, node_id: NodeId, config_path: &Path) -> Result<u32, SupervisionError>;

    /// Stop the process. Succeeds if none is running.
    async fn stop(&self, node_id: NodeId) -> Result<(), SupervisionError>;

    fn is_running(&self, node_id: NodeId) -> bool;
}

pub struct ProcessSupervisor {
    controller: Arc<dyn ProcessController>,
    store: ConfigStore,
    locks: DashMap<NodeId, Arc<Mutex<()>>>,
}

impl ProcessSupervisor {
    pub fn new(controller: Arc<dyn ProcessController>, store: ConfigStore) -> Self {
        Self {
            controller,
            store,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, node_id: NodeId) -> Arc<Mutex<()>> {
        self.locks
            .entry(node_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Stop the node's process and start a new one on the current document.
    pub async fn restart(&self, node_id: NodeId) -> Result<u32, SupervisionError> {
        let lock = self.lock_for(node_id);
        let _guard = lock.lock().await;

        let result: Result<u32, SupervisionError> = async {
            self.controller.stop(node_id).await?;
            self.controller
                .start(node_id, &self.store.config_path(node_id))
                .await
        }
        .await;

        match &result {
            Ok(pid) => {
                metrics::record_restart(true);
                tracing::info!(node = node_id, pid, "Node restarted");
            }
            Err(e) => {
                metrics::record_restart(false);
                tracing::error!(node = node_id, error = %e, "Node restart failed");
            }
        }
        result
    }

    pub async fn stop(&self, node_id: NodeId) -> Result<(), SupervisionError> {
        let lock = self.lock_for(node_id);
        let _guard = lock.lock().await;
        self.controller.stop(node_id).await
    }

    pub fn is_running(&self, node_id: NodeId) -> bool {
        self.controller.is_running(node_id)
    }

    /// Restart every node whose document exists on disk.
    pub async fn restart_all(&self, nodes: &[Node]) -> Vec<(NodeId, Result<u32, SupervisionError>)> {
        let mut results = Vec::with_capacity(nodes.len());
        for node in nodes {
            if !self.store.exists(node.id) {
                tracing::debug!(node = node.id, "No document yet, skipping start");
                continue;
            }
            results.push((node.id, self.restart(node.id).await));
        }
        results
    }
}
