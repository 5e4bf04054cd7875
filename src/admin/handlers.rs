use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::admin::AdminState;
use crate::registry::NodeId;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
}

/// Cached reachability as last recorded by the health probe.
#[derive(Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub api_port: u16,
    pub protocol: String,
    pub is_connected: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub subscribers: usize,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

pub async fn get_nodes(
    State(state): State<AdminState>,
) -> Result<Json<Vec<NodeStatus>>, StatusCode> {
    let nodes = state.registry.nodes().map_err(|e| {
        tracing::error!(error = %e, "Failed to list nodes for admin status");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let mut statuses = Vec::with_capacity(nodes.len());
    for node in nodes {
        let subscribers = state
            .registry
            .subscribers_on_node(node.id)
            .map(|subs| subs.len())
            .unwrap_or_default();
        statuses.push(NodeStatus {
            id: node.id,
            name: node.name,
            address: node.address,
            port: node.port,
            api_port: node.api_port,
            protocol: node.protocol,
            is_connected: node.is_connected,
            last_checked: node.last_checked,
            subscribers,
        });
    }

    Ok(Json(statuses))
}
