//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use nodeplane::config::{ControlConfig, PathsConfig};
use nodeplane::document::ConfigDocument;
use nodeplane::registry::{Node, NodeId, NodeSpec, Registry};
use nodeplane::service::ControlPlane;
use nodeplane::stats::{ProbeError, Stat, StatsClient};
use nodeplane::supervisor::{ProcessController, SupervisionError};

/// Records every start and stop instead of running a process.
#[derive(Default)]
pub struct RecordingController {
    pub events: Mutex<Vec<(NodeId, &'static str)>>,
    pub fail_start: AtomicBool,
    running: Mutex<HashSet<NodeId>>,
}

impl RecordingController {
    pub fn starts(&self, node_id: NodeId) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(id, ev)| *id == node_id && *ev == "start")
            .count()
    }
}

#[async_trait]
impl ProcessController for RecordingController {
    async fn start(&self, node_id: NodeId, _config_path: &Path) -> Result<u32, SupervisionError> {
        self.events.lock().push((node_id, "start"));
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(SupervisionError::Spawn {
                binary: "xray".into(),
                source: std::io::Error::other("scripted failure"),
            });
        }
        self.running.lock().insert(node_id);
        Ok(4242)
    }

    async fn stop(&self, node_id: NodeId) -> Result<(), SupervisionError> {
        self.events.lock().push((node_id, "stop"));
        self.running.lock().remove(&node_id);
        Ok(())
    }

    fn is_running(&self, node_id: NodeId) -> bool {
        self.running.lock().contains(&node_id)
    }
}

/// Answers stats calls from a per-node script and counts every call.
#[derive(Default)]
pub struct ScriptedStats {
    pub reachable: Mutex<HashSet<NodeId>>,
    pub counters: Mutex<HashMap<NodeId, Vec<Stat>>>,
    pub calls: AtomicUsize,
}

impl ScriptedStats {
    pub fn set_counters(&self, node_id: NodeId, names: &[&str]) {
        let stats = names
            .iter()
            .map(|name| Stat {
                name: name.to_string(),
                value: 1,
            })
            .collect();
        self.counters.lock().insert(node_id, stats);
        self.reachable.lock().insert(node_id);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatsClient for ScriptedStats {
    async fn connect(&self, node: &Node) -> Result<(), ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reachable.lock().contains(&node.id) {
            Ok(())
        } else {
            Err(ProbeError::Unreachable("scripted".into()))
        }
    }

    async fn query_stats(&self, node: &Node, pattern: &str) -> Result<Vec<Stat>, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.lock().contains(&node.id) {
            return Err(ProbeError::Unreachable("scripted".into()));
        }
        Ok(self
            .counters
            .lock()
            .get(&node.id)
            .map(|stats| {
                stats
                    .iter()
                    .filter(|s| s.name.contains(pattern))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub registry: Arc<Registry>,
    pub controller: Arc<RecordingController>,
    pub stats: Arc<ScriptedStats>,
    pub plane: ControlPlane,
}

pub fn config_in(dir: &Path) -> ControlConfig {
    let mut config = ControlConfig::default();
    config.paths = PathsConfig {
        config_dir: dir.join("etc"),
        log_dir: dir.join("log"),
        pid_dir: dir.join("run"),
    };
    config.database.path = dir.join("nodeplane.db");
    config
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut ControlConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        tweak(&mut config);

        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let controller = Arc::new(RecordingController::default());
        let stats = Arc::new(ScriptedStats::default());
        let plane = ControlPlane::new(config, registry.clone(), controller.clone(), stats.clone());

        Self {
            dir,
            registry,
            controller,
            stats,
            plane,
        }
    }

    /// Another control plane over the same directories and registry, as a
    /// separate CLI invocation would see them.
    pub fn second_plane(&self) -> ControlPlane {
        ControlPlane::new(
            config_in(self.dir.path()),
            self.registry.clone(),
            self.controller.clone(),
            self.stats.clone(),
        )
    }

    pub async fn node(&self, name: &str) -> Node {
        self.plane
            .create_server(
                "test",
                NodeSpec {
                    name: name.to_string(),
                    address: "127.0.0.1".to_string(),
                    port: 12345,
                    protocol: "vless".to_string(),
                    api_port: 54321,
                },
            )
            .await
            .unwrap()
            .value
    }

    pub fn document(&self, node_id: NodeId) -> ConfigDocument {
        self.plane
            .provisioning()
            .store()
            .read(node_id)
            .unwrap()
            .expect("document exists")
    }

    pub fn write_access_log(&self, node_id: NodeId, contents: &str) {
        let path = self.plane.provisioning().store().access_log_path(node_id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }
}
