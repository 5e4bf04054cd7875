//! The periodic enforcement pass.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::SchedulerConfig;
use crate::enforcement::policy::{
    evaluate, warning_message, DeactivationReason, Verdict, DEACTIVATED_MESSAGE,
};
use crate::observability::metrics;
use crate::provisioning::ProvisioningEngine;
use crate::registry::{Node, NodeId, NotificationKind, Registry, RegistryError, Subscriber};

pub const SYSTEM_ACTOR: &str = "system";
pub const AUTO_DEACTIVATED: &str = "auto_deactivated";

#[derive(Debug, Clone, Serialize)]
pub struct Deactivation {
    pub username: String,
    pub reason: DeactivationReason,
    /// Set when the credential removal could not be fully applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removal_error: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EnforcementReport {
    pub deactivated: Vec<Deactivation>,
    pub warned: Vec<String>,
    /// Nodes whose client list drifted and was rewritten.
    pub repaired_nodes: Vec<NodeId>,
}

pub struct EnforcementLoop {
    registry: Arc<Registry>,
    provisioning: Arc<ProvisioningEngine>,
    warning_days: i64,
    dedupe_warnings: bool,
}

impl EnforcementLoop {
    pub fn new(
        registry: Arc<Registry>,
        provisioning: Arc<ProvisioningEngine>,
        scheduler: &SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            provisioning,
            warning_days: scheduler.expiry_warning_days,
            dedupe_warnings: scheduler.dedupe_expiry_warnings,
        }
    }

    pub async fn run_cycle(&self) -> Result<EnforcementReport, RegistryError> {
        self.run_cycle_at(Utc::now()).await
    }

    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<EnforcementReport, RegistryError> {
        let mut report = EnforcementReport::default();

        for sub in self.registry.managed_subscribers()? {
            match evaluate(&sub, now, self.warning_days) {
                Verdict::Deactivate(reason) => {
                    if !sub.is_active {
                        continue;
                    }
                    if let Some(deactivation) = self.deactivate(&sub, reason).await? {
                        report.deactivated.push(deactivation);
                    }
                }
                Verdict::Warn { days_left } => {
                    if self.warn(&sub, days_left, now)? {
                        report.warned.push(sub.username.clone());
                    }
                }
                Verdict::Compliant => {}
            }
        }

        report.repaired_nodes = self.repair(now).await?;

        tracing::info!(
            deactivated = report.deactivated.len(),
            warned = report.warned.len(),
            repaired = report.repaired_nodes.len(),
            "Enforcement cycle complete"
        );
        Ok(report)
    }

    async fn deactivate(
        &self,
        sub: &Subscriber,
        reason: DeactivationReason,
    ) -> Result<Option<Deactivation>, RegistryError> {
        if !self
            .registry
            .deactivate(sub.id, SYSTEM_ACTOR, AUTO_DEACTIVATED, DEACTIVATED_MESSAGE)?
        {
            tracing::debug!(subscriber = %sub.username, "Already deactivated by a concurrent pass");
            return Ok(None);
        }
        metrics::record_deactivation(reason.as_str());
        tracing::info!(subscriber = %sub.username, reason = reason.as_str(), "Subscriber deactivated");

        let mut removal_error = None;
        if let Some(node) = self.assigned_node(sub)? {
            match self.provisioning.remove_credential(&sub.credential, &node).await {
                Ok(outcome) => removal_error = outcome.restart_error.map(|e| e.to_string()),
                Err(e) => {
                    tracing::error!(subscriber = %sub.username, node = node.id, error = %e, "Failed to remove credential");
                    removal_error = Some(e.to_string());
                }
            }
        }

        Ok(Some(Deactivation {
            username: sub.username.clone(),
            reason,
            removal_error,
        }))
    }

    fn warn(&self, sub: &Subscriber, days_left: i64, now: DateTime<Utc>) -> Result<bool, RegistryError> {
        if self.dedupe_warnings {
            let day_start = now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|start| start.and_utc())
                .unwrap_or(now);
            if self
                .registry
                .has_notification_since(sub.id, NotificationKind::ExpiryWarning, day_start)?
            {
                return Ok(false);
            }
        }
        self.registry
            .notify(sub.id, NotificationKind::ExpiryWarning, &warning_message(days_left))?;
        tracing::debug!(subscriber = %sub.username, days_left, "Expiry warning queued");
        Ok(true)
    }

    fn assigned_node(&self, sub: &Subscriber) -> Result<Option<Node>, RegistryError> {
        match sub.node_id {
            Some(node_id) => self.registry.node(node_id),
            None => Ok(None),
        }
    }

    /// Rewrite each materialized node's client list to the credentials that
    /// should currently be live there.
    async fn repair(&self, now: DateTime<Utc>) -> Result<Vec<NodeId>, RegistryError> {
        let mut repaired = Vec::new();
        for node in self.registry.nodes()? {
            if !self.provisioning.store().exists(node.id) {
                continue;
            }
            let desired = || match self.live_credentials(node.id, now) {
                Ok(wanted) => Some(wanted),
                Err(e) => {
                    tracing::error!(node = node.id, error = %e, "Failed to read assigned subscribers");
                    None
                }
            };
            match self.provisioning.sync_credentials(&node, desired).await {
                Ok(outcome) if outcome.changed => {
                    tracing::warn!(node = node.id, "Node client list drifted, repaired");
                    repaired.push(node.id);
                }
                Ok(_) => {}
                Err(e) => tracing::error!(node = node.id, error = %e, "Client list repair failed"),
            }
        }
        Ok(repaired)
    }

    /// Credentials of active subscribers on `node_id` that pass policy at `now`.
    fn live_credentials(&self, node_id: NodeId, now: DateTime<Utc>) -> Result<BTreeSet<String>, RegistryError> {
        Ok(self
            .registry
            .subscribers_on_node(node_id)?
            .into_iter()
            .filter(|sub| sub.is_active)
            .filter(|sub| !matches!(evaluate(sub, now, self.warning_days), Verdict::Deactivate(_)))
            .map(|sub| sub.credential)
            .collect())
    }
}
