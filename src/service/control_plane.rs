//! Wiring of the control-plane components and the consumer operations.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::{ControlConfig, MAX_VALIDITY_DAYS};
use crate::document::ConfigStore;
use crate::enforcement::{EnforcementLoop, EnforcementReport};
use crate::health::HealthProbe;
use crate::observability::metrics;
use crate::provisioning::{ProvisionOutcome, ProvisioningEngine};
use crate::registry::{
    Node, NodeId, NodeSpec, NodeUpdate, NotificationKind, Registry, Subscriber,
    SubscriberRecord,
};
use crate::service::types::{
    Applied, ControlError, ControlResult, NewUser, OnlineStatus, RenewRequest,
};
use crate::stats::{GrpcStatsClient, SessionTracker, StatsClient};
use crate::supervisor::{LocalProcessController, ProcessController, ProcessSupervisor};
use crate::traffic::{MeterReport, TrafficMeter};

pub struct ControlPlane {
    config: Arc<ControlConfig>,
    registry: Arc<Registry>,
    supervisor: Arc<ProcessSupervisor>,
    provisioning: Arc<ProvisioningEngine>,
    health: Arc<HealthProbe>,
    sessions: SessionTracker,
    meter: TrafficMeter,
    enforcement: EnforcementLoop,
}

impl ControlPlane {
    /// Open the registry and wire the local process controller and the
    /// gRPC stats client.
    pub fn open(config: ControlConfig) -> ControlResult<Self> {
        let registry = Arc::new(Registry::open(&config.database.path)?);
        let controller = Arc::new(LocalProcessController::new(&config.supervisor, &config.paths));
        let stats = Arc::new(GrpcStatsClient::new(config.probe.timeout()));
        Ok(Self::new(config, registry, controller, stats))
    }

    pub fn new(
        config: ControlConfig,
        registry: Arc<Registry>,
        controller: Arc<dyn ProcessController>,
        stats: Arc<dyn StatsClient>,
    ) -> Self {
        let config = Arc::new(config);
        let store = ConfigStore::new(&config.paths);
        let supervisor = Arc::new(ProcessSupervisor::new(controller, store.clone()));
        let provisioning = Arc::new(ProvisioningEngine::new(store.clone(), supervisor.clone()));

        Self {
            health: Arc::new(HealthProbe::new(registry.clone(), stats.clone())),
            sessions: SessionTracker::new(registry.clone(), stats),
            meter: TrafficMeter::new(registry.clone(), store, provisioning.clone()),
            enforcement: EnforcementLoop::new(
                registry.clone(),
                provisioning.clone(),
                &config.scheduler,
            ),
            config,
            registry,
            supervisor,
            provisioning,
        }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn provisioning(&self) -> &Arc<ProvisioningEngine> {
        &self.provisioning
    }

    pub fn health(&self) -> &Arc<HealthProbe> {
        &self.health
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    pub fn meter(&self) -> &TrafficMeter {
        &self.meter
    }

    fn find_user(&self, username: &str) -> ControlResult<Subscriber> {
        self.registry
            .subscriber_by_username(username)?
            .ok_or_else(|| ControlError::NotFound {
                entity: "user",
                key: username.to_string(),
            })
    }

    /// The node a subscriber's credential belongs on. Administrative
    /// records are never provisioned.
    fn provisioned_node(&self, sub: &Subscriber) -> ControlResult<Option<Node>> {
        if sub.role.is_administrative() {
            return Ok(None);
        }
        match sub.node_id {
            Some(node_id) => Ok(self.registry.node(node_id)?),
            None => Ok(None),
        }
    }

    // --- Subscribers ---

    pub async fn create_user(&self, actor: &str, req: NewUser) -> ControlResult<Applied<Subscriber>> {
        let username = req.username.trim();
        if username.is_empty() {
            return Err(ControlError::InvalidRequest("username must not be empty".into()));
        }
        if self.registry.subscriber_by_username(username)?.is_some() {
            return Err(ControlError::Conflict(format!("username '{username}' already exists")));
        }
        if let Some(node_id) = req.node_id {
            self.registry.require_node(node_id)?;
        }

        let expiry = if req.role.is_administrative() {
            None
        } else {
            Some(expiry_after(self.config.subscribers.default_validity_days)?)
        };
        let sub = self.registry.insert_subscriber(&SubscriberRecord {
            username: username.to_string(),
            credential: Uuid::new_v4().to_string(),
            role: req.role,
            traffic_limit_gb: req.traffic_limit_gb,
            expiry,
            node_id: req.node_id,
        })?;
        self.registry
            .append_audit(Some(sub.id), actor, &format!("create_user: {username}"))?;
        self.registry
            .notify(sub.id, NotificationKind::Welcome, &format!("Welcome, {username}!"))?;
        tracing::info!(subscriber = %sub.username, role = %sub.role, node = ?sub.node_id, "User created");

        let outcome = match self.provisioned_node(&sub)? {
            Some(node) => Some(self.provisioning.add_credential(&sub.credential, &node).await?),
            None => None,
        };
        Ok(Applied::with_outcome(sub, outcome))
    }

    pub async fn delete_user(&self, actor: &str, username: &str) -> ControlResult<Applied<Subscriber>> {
        let sub = self.find_user(username)?;
        let node = self.provisioned_node(&sub)?;

        self.registry.delete_subscriber(sub.id)?;
        self.registry
            .append_audit(Some(sub.id), actor, &format!("delete_user: {username}"))?;
        tracing::info!(subscriber = %sub.username, "User deleted");

        let outcome = match node {
            Some(node) => Some(self.provisioning.remove_credential(&sub.credential, &node).await?),
            None => None,
        };
        Ok(Applied::with_outcome(sub, outcome))
    }

    pub async fn toggle_active(&self, actor: &str, username: &str) -> ControlResult<Applied<Subscriber>> {
        let mut sub = self.find_user(username)?;
        sub.is_active = !sub.is_active;

        self.registry.set_active(sub.id, sub.is_active)?;
        self.registry.append_audit(
            Some(sub.id),
            actor,
            &format!("toggle_active: {username} -> {}", sub.is_active),
        )?;
        tracing::info!(subscriber = %sub.username, active = sub.is_active, "User toggled");

        let outcome: Option<ProvisionOutcome> = match self.provisioned_node(&sub)? {
            Some(node) if sub.is_active => {
                Some(self.provisioning.add_credential(&sub.credential, &node).await?)
            }
            Some(node) => Some(self.provisioning.remove_credential(&sub.credential, &node).await?),
            None => None,
        };
        Ok(Applied::with_outcome(sub, outcome))
    }

    /// Set a new limit and expiry. Reactivation is a separate toggle.
    pub fn renew(&self, actor: &str, username: &str, req: RenewRequest) -> ControlResult<Subscriber> {
        let expiry = expiry_after(req.days)?;
        let sub = self.find_user(username)?;
        if sub.role.is_administrative() {
            return Err(ControlError::NotFound {
                entity: "user",
                key: username.to_string(),
            });
        }

        self.registry.renew(sub.id, req.traffic_limit_gb, expiry)?;
        self.registry
            .append_audit(Some(sub.id), actor, &format!("renew_user: {username}"))?;
        tracing::info!(subscriber = %sub.username, days = req.days, limit_gb = req.traffic_limit_gb, "User renewed");

        Ok(Subscriber {
            traffic_limit_gb: req.traffic_limit_gb,
            expiry: Some(expiry),
            ..sub
        })
    }

    pub fn list_users(&self) -> ControlResult<Vec<Subscriber>> {
        Ok(self.registry.subscribers()?)
    }

    /// Refresh every subscriber's online flag from the live session counters.
    pub async fn check_online(&self, actor: &str) -> ControlResult<Vec<OnlineStatus>> {
        let now = Utc::now();
        let mut statuses = Vec::new();
        let mut updates = Vec::new();

        for node in self.registry.nodes()? {
            let active = self.sessions.active_credentials(node.id).await;
            for sub in self.registry.subscribers_on_node(node.id)? {
                let online = active.contains(&sub.credential) && sub.is_active && !sub.is_expired_at(now);
                updates.push((sub.id, online));
                statuses.push(OnlineStatus {
                    username: sub.username,
                    node_id: node.id,
                    is_online: online,
                });
            }
        }

        self.registry.set_online_many(&updates)?;
        self.registry.append_audit(None, actor, "check_online_users")?;
        tracing::info!(
            checked = statuses.len(),
            online = statuses.iter().filter(|s| s.is_online).count(),
            "Online status updated"
        );
        Ok(statuses)
    }

    // --- Nodes ---

    pub async fn create_server(&self, actor: &str, spec: NodeSpec) -> ControlResult<Applied<Node>> {
        validate_node(&spec.address, spec.port, &spec.protocol, spec.api_port)?;
        if spec.name.trim().is_empty() {
            return Err(ControlError::InvalidNode("name must not be empty".into()));
        }

        let node = self.registry.insert_node(&spec)?;
        self.registry
            .append_audit(None, actor, &format!("create_server: {}", node.name))?;
        tracing::info!(node = node.id, name = %node.name, address = %node.address, "Node created");

        let outcome = self.provisioning.materialize(&node).await?;
        Ok(Applied::with_outcome(node, Some(outcome)))
    }

    pub async fn update_server(
        &self,
        actor: &str,
        id: NodeId,
        update: NodeUpdate,
    ) -> ControlResult<Applied<Node>> {
        validate_node(&update.address, update.port, &update.protocol, update.api_port)?;

        let node = self.registry.update_node(id, &update)?;
        self.registry
            .append_audit(None, actor, &format!("update_server: {id}"))?;
        tracing::info!(node = node.id, port = node.port, api_port = node.api_port, "Node updated");

        let outcome = self.provisioning.retarget(&node).await?;
        Ok(Applied::with_outcome(node, Some(outcome)))
    }

    /// All nodes, optionally after refreshing their reachability.
    pub async fn list_nodes(&self, probe: bool) -> ControlResult<Vec<Node>> {
        if probe {
            self.health.check_all().await;
        }
        Ok(self.registry.nodes()?)
    }

    pub async fn probe_all(&self) -> Vec<(NodeId, bool)> {
        let started = Instant::now();
        let results = self.health.check_all().await;
        metrics::record_cycle("health", started.elapsed());
        results
    }

    // --- Control loops ---

    pub async fn run_enforcement(&self) -> ControlResult<EnforcementReport> {
        let started = Instant::now();
        let report = self.enforcement.run_cycle().await?;
        metrics::record_cycle("enforcement", started.elapsed());
        Ok(report)
    }

    pub async fn run_metering(&self) -> Vec<MeterReport> {
        let started = Instant::now();
        let reports = self.meter.run_cycle().await;
        metrics::record_cycle("metering", started.elapsed());
        reports
    }

    /// Start every materialized node's process on its current document.
    pub async fn start_nodes(&self) -> ControlResult<usize> {
        let nodes = self.registry.nodes()?;
        let results = self.supervisor.restart_all(&nodes).await;
        Ok(results.iter().filter(|(_, r)| r.is_ok()).count())
    }
}

/// `now + days`, rejecting non-positive and out-of-range periods.
fn expiry_after(days: i64) -> ControlResult<DateTime<Utc>> {
    if days <= 0 {
        return Err(ControlError::InvalidRequest("days must be positive".into()));
    }
    if days > MAX_VALIDITY_DAYS {
        return Err(ControlError::InvalidRequest(format!(
            "days must not exceed {MAX_VALIDITY_DAYS}"
        )));
    }
    Duration::try_days(days)
        .and_then(|period| Utc::now().checked_add_signed(period))
        .ok_or_else(|| ControlError::InvalidRequest(format!("{days} days is out of range")))
}

fn validate_node(address: &str, port: u16, protocol: &str, api_port: u16) -> ControlResult<()> {
    if address.trim().is_empty() {
        return Err(ControlError::InvalidNode("address must not be empty".into()));
    }
    if protocol.trim().is_empty() {
        return Err(ControlError::InvalidNode("protocol must not be empty".into()));
    }
    if port == 0 || api_port == 0 {
        return Err(ControlError::InvalidNode("ports must be non-zero".into()));
    }
    if port == api_port {
        return Err(ControlError::InvalidNode(format!(
            "traffic port and api port must differ (both {port})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_validation() {
        assert!(validate_node("10.0.0.1", 443, "vless", 10085).is_ok());
        assert!(validate_node("", 443, "vless", 10085).is_err());
        assert!(validate_node("10.0.0.1", 443, " ", 10085).is_err());
        assert!(validate_node("10.0.0.1", 0, "vless", 10085).is_err());
        assert!(validate_node("10.0.0.1", 443, "vless", 443).is_err());
    }

    #[test]
    fn test_expiry_period_is_bounded() {
        assert!(expiry_after(30).unwrap() > Utc::now());
        assert!(expiry_after(MAX_VALIDITY_DAYS).is_ok());
        for days in [0, -1, MAX_VALIDITY_DAYS + 1, 100_000_000, i64::MAX] {
            assert!(matches!(expiry_after(days), Err(ControlError::InvalidRequest(_))), "{days}");
        }
    }
}
