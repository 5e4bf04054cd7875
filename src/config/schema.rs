//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the control plane.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Placeholder key shipped in the default admin configuration.
pub const PLACEHOLDER_API_KEY: &str = "CHANGE_ME_IN_PRODUCTION";

/// Root configuration for the node control plane.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ControlConfig {
    /// Relational registry settings.
    pub database: DatabaseConfig,

    /// On-disk locations for node documents, access logs and pid files.
    pub paths: PathsConfig,

    /// Managed proxy process settings.
    pub supervisor: SupervisorConfig,

    /// Stats RPC probe settings.
    pub probe: ProbeConfig,

    /// Periodic job settings.
    pub scheduler: SchedulerConfig,

    /// Defaults applied to new subscriber records.
    pub subscribers: SubscriberConfig,

    /// Read-only admin surface.
    pub admin: AdminConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Registry database configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("nodeplane.db"),
        }
    }
}

/// Filesystem layout shared with the managed proxy processes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding one `config_{id}.json` per node.
    pub config_dir: PathBuf,

    /// Directory holding one `access_{id}.log` per node.
    pub log_dir: PathBuf,

    /// Directory holding one `node_{id}.pid` per running process.
    pub pid_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/xray"),
            log_dir: PathBuf::from("/var/log/xray"),
            pid_dir: PathBuf::from("/run/nodeplane"),
        }
    }
}

/// Managed process configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Proxy engine binary (resolved through PATH when not absolute).
    pub binary: String,

    /// Arguments passed to the binary. `{config}` expands to the document path.
    pub args: Vec<String>,

    /// Seconds to wait after SIGTERM before escalating to SIGKILL.
    pub stop_timeout_secs: u64,

    /// How long a freshly spawned process must stay up before `start`
    /// reports success, in milliseconds. Every restart pays this delay;
    /// 0 skips the crash check.
    pub startup_grace_ms: u64,
}

impl SupervisorConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            binary: "xray".to_string(),
            args: vec!["run".to_string(), "-c".to_string(), "{config}".to_string()],
            stop_timeout_secs: 5,
            startup_grace_ms: 300,
        }
    }
}

/// Stats RPC probe configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Upper bound for every stats RPC call, in seconds.
    pub timeout_secs: u64,
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self { timeout_secs: 5 }
    }
}

/// Periodic job configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Expiry/limit enforcement interval in seconds.
    pub enforcement_interval_secs: u64,

    /// Access log metering interval in seconds.
    pub metering_interval_secs: u64,

    /// Reachability probe interval in seconds (0 disables the probe loop).
    pub health_interval_secs: u64,

    /// Subscribers expiring within this many days receive a warning.
    pub expiry_warning_days: i64,

    /// Send at most one expiry warning per subscriber per UTC day.
    pub dedupe_expiry_warnings: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enforcement_interval_secs: 3600,
            metering_interval_secs: 3600,
            health_interval_secs: 300,
            expiry_warning_days: 3,
            dedupe_expiry_warnings: false,
        }
    }
}

/// Longest validity period accepted anywhere, in days.
pub const MAX_VALIDITY_DAYS: i64 = 36_500;

/// Subscriber defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Validity period assigned to newly created subscribers, in days.
    pub default_validity_days: i64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            default_validity_days: 30,
        }
    }
}

/// Admin surface configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the read-only admin surface.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin surface bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: PLACEHOLDER_API_KEY.to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Prometheus endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
