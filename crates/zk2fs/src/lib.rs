//! zk2fs library: Exposes the daemon components for testing.
//!
//! This is a thin library layer over the daemon binary,
//! allowing integration tests to drive the same wiring.

pub mod config;
pub mod snapshot;
pub mod topology;

pub use config::{Config, MirrorKind, MirrorSpec};
pub use snapshot::{load_snapshot, populate};
pub use topology::{children_sync, sync_all, StaticPrefixes};
