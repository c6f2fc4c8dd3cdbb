//! zksync: mirrors a coordination service namespace onto the local filesystem.
//!
//! This crate provides:
//! - The `Coordinator` trait abstraction over the coordination client
//! - Atomic mirror writes stamped with the remote modification time
//! - Sorted three-way reconciliation of remote children against local files
//! - `SyncEngine`, which owns the watch bookkeeping and serializes deliveries

pub mod coordinator;
pub mod diff;
pub mod engine;
pub mod events;
pub mod memory;
pub mod mirror;
pub mod strategy;

pub use coordinator::{
    CoordError, Coordinator, EventType, NodeStat, SessionState, WatchEvent, WatchKind,
};
pub use diff::{diff_children, ChildrenDiff};
pub use engine::{DataDelivery, Reconciliation, SyncEngine, SyncError, WatchAction};
pub use events::{EventBus, MirrorEvent, Subscription};
pub use memory::InMemoryCoordinator;
pub use mirror::{Mirror, MirrorError, WriteMode};
pub use strategy::{
    AlwaysWatch, ChildHandler, ChildrenSync, DataHandler, Predicates, SubtreeHandler,
    TraceEventHandler, TraceShardHandler, WatchPolicy,
};
