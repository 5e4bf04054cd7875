//! Read-modify-write of node documents followed by a restart.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::document::{ConfigDocument, ConfigStore, MalformedDocument, StorageError};
use crate::observability::metrics;
use crate::registry::{Node, NodeId};
use crate::supervisor::{ProcessSupervisor, SupervisionError};

/// Result of a provisioning call whose document write succeeded.
#[derive(Debug, Default)]
pub struct ProvisionOutcome {
    /// The document was rewritten.
    pub changed: bool,
    /// Set when a restart was attempted and failed.
    pub restart_error: Option<SupervisionError>,
}

impl ProvisionOutcome {
    pub fn restarted_cleanly(&self) -> bool {
        self.restart_error.is_none()
    }
}

#[derive(Clone, Copy)]
enum Restart {
    Always,
    OnChange,
}

pub struct ProvisioningEngine {
    store: ConfigStore,
    supervisor: Arc<ProcessSupervisor>,
    locks: DashMap<NodeId, Arc<Mutex<()>>>,
}

impl ProvisioningEngine {
    pub fn new(store: ConfigStore, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            store,
            supervisor,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    fn lock_for(&self, node_id: NodeId) -> Arc<Mutex<()>> {
        self.locks
            .entry(node_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Apply `mutate` to the node's document under the node lock, saving
    /// it when the closure reports a change. The in-process mutex queues
    /// tasks of this engine; the document lock file excludes other
    /// processes. Both are released before any restart.
    async fn apply<F>(
        &self,
        op: &'static str,
        node: &Node,
        restart: Restart,
        mutate: F,
    ) -> Result<ProvisionOutcome, StorageError>
    where
        F: FnOnce(&mut ConfigDocument) -> Result<bool, MalformedDocument>,
    {
        let changed = {
            let lock = self.lock_for(node.id);
            let _guard = lock.lock().await;

            let saved = self.load_modify_save(node, mutate);
            if let Err(e) = &saved {
                metrics::record_provisioning(op, "storage_error");
                tracing::error!(node = node.id, op, error = %e, "Document update failed");
            }
            saved?
        };

        let mut outcome = ProvisionOutcome {
            changed,
            restart_error: None,
        };
        if changed || matches!(restart, Restart::Always) {
            if let Err(e) = self.supervisor.restart(node.id).await {
                outcome.restart_error = Some(e);
            }
        }

        let label = match (&outcome.restart_error, outcome.changed) {
            (Some(_), _) => "restart_failed",
            (None, true) => "changed",
            (None, false) => "unchanged",
        };
        metrics::record_provisioning(op, label);
        tracing::debug!(node = node.id, op, changed, "Provisioning applied");
        Ok(outcome)
    }

    fn load_modify_save<F>(&self, node: &Node, mutate: F) -> Result<bool, StorageError>
    where
        F: FnOnce(&mut ConfigDocument) -> Result<bool, MalformedDocument>,
    {
        let _doc_lock = self.store.lock(node.id)?;
        let mut doc = self.store.load(node)?;
        let changed = mutate(&mut doc)
            .map_err(|e| StorageError::malformed(self.store.config_path(node.id), e))?;
        if changed {
            self.store.save(node.id, &doc)?;
        }
        Ok(changed)
    }

    /// Ensure the node accepts `credential`.
    pub async fn add_credential(
        &self,
        credential: &str,
        node: &Node,
    ) -> Result<ProvisionOutcome, StorageError> {
        self.apply("add", node, Restart::Always, |doc| doc.insert_client(credential))
            .await
    }

    /// Ensure the node no longer accepts `credential`.
    pub async fn remove_credential(
        &self,
        credential: &str,
        node: &Node,
    ) -> Result<ProvisionOutcome, StorageError> {
        self.apply("remove", node, Restart::Always, |doc| doc.remove_client(credential))
            .await
    }

    /// Remove a batch of credentials with at most one restart.
    pub async fn prune_credentials(
        &self,
        node: &Node,
        credentials: &[String],
    ) -> Result<ProvisionOutcome, StorageError> {
        self.apply("prune", node, Restart::OnChange, |doc| {
            let mut changed = false;
            for credential in credentials {
                changed |= doc.remove_client(credential)?;
            }
            Ok(changed)
        })
        .await
    }

    /// Make the node's client list equal the set returned by `desired`.
    ///
    /// `desired` runs while the node's document is locked, so credentials
    /// committed by a concurrent add are either in the set or added after
    /// the sync. `None` leaves the document untouched.
    pub async fn sync_credentials<D>(
        &self,
        node: &Node,
        desired: D,
    ) -> Result<ProvisionOutcome, StorageError>
    where
        D: FnOnce() -> Option<BTreeSet<String>>,
    {
        self.apply("sync", node, Restart::OnChange, |doc| match desired() {
            Some(wanted) => doc.retain_clients(&wanted),
            None => Ok(false),
        })
        .await
    }

    /// Create the node's document if absent and start its process.
    pub async fn materialize(&self, node: &Node) -> Result<ProvisionOutcome, StorageError> {
        let existed = self.store.exists(node.id);
        let mut outcome = self
            .apply("materialize", node, Restart::Always, |doc| {
                Ok(doc.ensure_api_wiring(node.api_port))
            })
            .await?;
        outcome.changed |= !existed;
        Ok(outcome)
    }

    /// Rewrite ports and protocol after a node update and restart.
    pub async fn retarget(&self, node: &Node) -> Result<ProvisionOutcome, StorageError> {
        self.apply("retarget", node, Restart::Always, |doc| doc.retarget(node))
            .await
    }
}
