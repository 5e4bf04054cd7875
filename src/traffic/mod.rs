//! Traffic metering subsystem.
//!
//! # Data Flow
//! ```text
//! /var/log/xray/access_{id}.log
//!     → log_parser.rs (bytes per credential, lossy line decoding)
//!     → meter.rs (sum → GB, overwrite traffic_used_gb)
//!     → ProvisioningEngine::prune_credentials (over-limit, one restart)
//! ```
//!
//! # Design Decisions
//! - The log is the cumulative source of truth; usage is overwritten, never added
//! - Credentials absent from the log keep their stored usage
//! - Pruning removes access only; deactivation belongs to the enforcement loop

pub mod log_parser;
pub mod meter;

pub use log_parser::{parse_access_log, LogTotals, BYTES_PER_GB};
pub use meter::{MeterError, MeterReport, TrafficMeter};
