//! Credential provisioning subsystem.
//!
//! # Data Flow
//! ```text
//! ControlPlane / EnforcementLoop / TrafficMeter
//!     → engine.rs (per-node mutex, then lock file: load → mutate → atomic save)
//!     → ProcessSupervisor::restart (outside the lock)
//! ```
//!
//! # Design Decisions
//! - Single add/remove always restart so the caller sees the outcome
//! - Batch prune and sync restart only when the document changed
//! - A failed save never restarts; a failed restart never reverts the save
//! - The lock file is what orders a CLI invocation against the daemon

pub mod engine;

pub use engine::{ProvisionOutcome, ProvisioningEngine};
