//! ODB Core: shared-memory online database engine
//!
//! A hierarchical, typed key/value store living in one memory-mapped region
//! shared by every process attached to it. Designed for data acquisition
//! systems where producers, consumers and a central server exchange
//! configuration and run state.
//!
//! # Architecture
//!
//! - **Region**: a file mapped `MAP_SHARED`; all structures reference each
//!   other by offset, so every process can map it at its own address
//! - **Allocator**: first-fit free lists over an index area and a payload area
//! - **Tree index**: directories, typed leaves and symbolic links
//! - **Clients and locking**: a client table in the region header, a
//!   recursive two-layer lock, and reclamation of dead or unresponsive clients
//! - **Validator**: bounds, cycle and consistency checks with in-place repair
//! - **Records and notifications**: hot-links that report changes of a
//!   subtree to local observers or to a remote transport
//! - **Snapshots and housekeeping**: checksummed region snapshots and a
//!   background heartbeat/cleanup/flush thread
//!
//! The ASCII, XML and JSON subtree codecs live in the `odb-codec` crate.

mod alloc;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod housekeeping;
mod lock;
pub mod notify;
pub mod platform;
pub mod record;
mod region;
pub mod snapshot;
pub mod tree;
pub mod types;
pub mod validate;
mod value;

// Re-export key types for convenience
pub use client::{ClientInfo, Reclaimed};
pub use config::Config;
pub use engine::Database;
pub use error::{OdbError, OdbResult};
pub use housekeeping::HousekeepingStats;
pub use notify::{Event, Notification, Observer, RemoteTransport};
pub use record::RecordId;
pub use snapshot::{read_snapshot, write_snapshot};
pub use tree::{split_index, KeyInfo};
pub use types::{AccessMode, OdbType, TypeId, Value};
pub use validate::ValidationReport;
