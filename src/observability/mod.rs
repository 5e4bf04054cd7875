//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events on stderr)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (journald, file, remote)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Every control-plane event carries the node and subscriber as fields
//! - Logs go to stderr so CLI output on stdout stays machine readable
//! - Metrics are cheap (atomic increments) and optional

pub mod logging;
pub mod metrics;
