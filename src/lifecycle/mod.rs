//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Scheduler (scheduler.rs):
//!     interval tick → enforcement / metering / health job (inline, no overlap)
//!
//! Shutdown (shutdown.rs):
//!     Signal received → broadcast → every periodic job exits its loop
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Each job has its own interval and task; a slow job never delays another
//! - A cycle in progress completes before its task observes shutdown
//! - Proxy processes outlive the daemon; shutdown does not stop nodes

pub mod scheduler;
pub mod shutdown;
pub mod signals;

pub use scheduler::spawn_periodic;
pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
