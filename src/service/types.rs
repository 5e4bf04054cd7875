//! Request, result and error types of the consumer interface.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::StorageError;
use crate::provisioning::ProvisionOutcome;
use crate::registry::{NodeId, RegistryError, Role};

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub username: String,
    #[serde(default = "default_role")]
    pub role: Role,
    /// GB, 0 means unlimited.
    #[serde(default)]
    pub traffic_limit_gb: u64,
    #[serde(default)]
    pub node_id: Option<NodeId>,
}

fn default_role() -> Role {
    Role::Subscriber
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenewRequest {
    pub traffic_limit_gb: u64,
    pub days: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OnlineStatus {
    pub username: String,
    pub node_id: NodeId,
    pub is_online: bool,
}

/// A committed change plus the outcome of the restart it triggered.
///
/// `restart_error` set means the change is saved but the node is still
/// running its previous document.
#[derive(Debug, Clone, Serialize)]
pub struct Applied<T> {
    pub value: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_error: Option<String>,
}

impl<T> Applied<T> {
    pub fn with_outcome(value: T, outcome: Option<ProvisionOutcome>) -> Self {
        Self {
            value,
            restart_error: outcome
                .and_then(|o| o.restart_error)
                .map(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Registry(RegistryError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid node: {0}")]
    InvalidNode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<RegistryError> for ControlError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { entity, key } => ControlError::NotFound { entity, key },
            RegistryError::Conflict(msg) => ControlError::Conflict(msg),
            other => ControlError::Registry(other),
        }
    }
}

pub type ControlResult<T> = Result<T, ControlError>;
