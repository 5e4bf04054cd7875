//! Consumer interface of the control plane.
//!
//! # Data Flow
//! ```text
//! CLI / embedding layer
//!     → ControlPlane operation
//!     → Registry commit (record + audit + notification)
//!     → ProvisioningEngine (document) → ProcessSupervisor (restart)
//!     → Applied { value, restart_error }
//! ```
//!
//! # Design Decisions
//! - Relational state commits before any document or process side effect
//! - A failed document write fails the operation; a failed restart does not

pub mod control_plane;
pub mod types;

pub use control_plane::ControlPlane;
pub use types::{Applied, ControlError, ControlResult, NewUser, OnlineStatus, RenewRequest};
