//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ControlConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart of the daemon
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, load_or_default, ConfigError};
pub use schema::{ControlConfig, MAX_VALIDITY_DAYS};
pub use schema::{
    AdminConfig, DatabaseConfig, ObservabilityConfig, PathsConfig, ProbeConfig,
    SchedulerConfig, SubscriberConfig, SupervisorConfig,
};
