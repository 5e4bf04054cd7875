//! Control plane for a fleet of proxy nodes.

pub mod admin;
pub mod config;
pub mod document;
pub mod enforcement;
pub mod health;
pub mod lifecycle;
pub mod observability;
pub mod provisioning;
pub mod registry;
pub mod service;
pub mod stats;
pub mod supervisor;
pub mod traffic;

pub use config::schema::ControlConfig;
pub use lifecycle::Shutdown;
pub use service::ControlPlane;
