//! Read-only admin status surface.
//!
//! Serves cached observations only; nothing here probes a node or mutates
//! state.

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::registry::Registry;

#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<Registry>,
    pub api_key: Arc<str>,
    pub started: Instant,
}

impl AdminState {
    pub fn new(registry: Arc<Registry>, api_key: &str) -> Self {
        Self {
            registry,
            api_key: Arc::from(api_key),
            started: Instant::now(),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/nodes", get(get_nodes))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin router on `listener` until shutdown.
pub async fn serve(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    tracing::info!(address = ?listener.local_addr().ok(), "Admin surface listening");
    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Shutdown;
    use crate::registry::NodeSpec;

    async fn spawn_admin(registry: Arc<Registry>) -> (String, Shutdown) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = Shutdown::new();
        let state = AdminState::new(registry, "secret");
        tokio::spawn(serve(listener, state, shutdown.subscribe()));
        (url, shutdown)
    }

    #[tokio::test]
    async fn test_requests_without_key_are_rejected() {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let (url, shutdown) = spawn_admin(registry).await;
        let client = reqwest::Client::new();

        let res = client.get(format!("{url}/admin/status")).send().await.unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::UNAUTHORIZED);

        let res = client
            .get(format!("{url}/admin/status"))
            .bearer_auth("wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::UNAUTHORIZED);
        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_nodes_report_cached_reachability() {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        registry
            .insert_node(&NodeSpec {
                name: "edge-1".into(),
                address: "10.0.0.1".into(),
                port: 12345,
                protocol: "vless".into(),
                api_port: 54321,
            })
            .unwrap();
        let (url, shutdown) = spawn_admin(registry).await;

        let body: serde_json::Value = reqwest::Client::new()
            .get(format!("{url}/admin/nodes"))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body[0]["name"], "edge-1");
        assert_eq!(body[0]["is_connected"], false);
        assert_eq!(body[0]["subscribers"], 0);
        shutdown.trigger();
    }
}
