//! Node health subsystem.
//!
//! # Data Flow
//! ```text
//! Scheduler tick / explicit probe
//!     → probe.rs (HealthProbe: connect within the probe timeout)
//!     → Registry::record_reachability (is_connected, last_checked)
//!     → nodeplane_node_reachable gauge
//! ```
//!
//! # Design Decisions
//! - The recorded observation is a cache; SessionTracker trusts it to skip
//!   unreachable nodes
//! - All nodes are probed concurrently so one slow node bounds the cycle

pub mod probe;

pub use probe::HealthProbe;
