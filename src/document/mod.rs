//! Node document subsystem.
//!
//! # Data Flow
//! ```text
//! Node record → model.rs (ConfigDocument::generate)
//!             → store.rs (ConfigStore: flock, unique tmp write, fsync, rename)
//!             → /etc/xray/config_{id}.json → read by the proxy process at start
//! ```
//!
//! # Design Decisions
//! - The document is the authority for which credentials a node accepts
//! - Unknown keys are preserved so operators can hand-tune a node
//! - The first inbound is the traffic inbound; the api inbound is found by tag

pub mod model;
pub mod store;

pub use model::{ClientEntry, ConfigDocument, MalformedDocument, API_TAG};
pub use store::{ConfigStore, DocumentLock, StorageError};
