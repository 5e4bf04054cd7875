//! Subscription enforcement subsystem.
//!
//! # Data Flow
//! ```text
//! Scheduler tick
//!     → control_loop.rs: every non-administrative subscriber
//!         → policy.rs evaluate(sub, now)
//!         → Deactivate: Registry::deactivate (flag + audit + notification)
//!                       → ProvisioningEngine::remove_credential
//!         → Warn: expiry warning notification
//!     → sync every materialized node to its active, compliant credentials
//! ```
//!
//! # Design Decisions
//! - Relational deactivation commits before the document changes
//! - Already-inactive records are left alone, so re-runs are no-ops
//! - The closing sync repairs drift left by failed removals or hand edits

pub mod control_loop;
pub mod policy;

pub use control_loop::{Deactivation, EnforcementLoop, EnforcementReport, AUTO_DEACTIVATED};
pub use policy::{evaluate, DeactivationReason, Verdict, DEACTIVATED_MESSAGE};
