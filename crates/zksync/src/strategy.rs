//! Strategies injected into children reconciliation.
//!
//! `WatchPolicy` decides whether a children subscription is installed and
//! renewed; `ChildHandler` decides what an added or removed child means on
//! disk. Both have defaults (`AlwaysWatch`, `DataHandler`) so a plain
//! `ChildrenSync::new()` mirrors a directory of leaf values.

use crate::engine::{Result, SyncEngine, SyncError};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info};

/// Decides whether a parent's children stay subscribed.
///
/// A subscription is kept if either decision says yes.
pub trait WatchPolicy: Send + Sync {
    /// Path-only decision made before listing.
    fn need_watch(&self, path: &str) -> bool;

    /// Decision made after listing, over the sorted child names.
    fn cont_watch(&self, path: &str, children: &[String]) -> bool;
}

/// Watch everything, forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysWatch;

impl WatchPolicy for AlwaysWatch {
    fn need_watch(&self, _path: &str) -> bool {
        true
    }

    fn cont_watch(&self, _path: &str, _children: &[String]) -> bool {
        true
    }
}

/// Policy built from two closures.
pub struct Predicates<N, C> {
    need: N,
    cont: C,
}

impl<N, C> Predicates<N, C>
where
    N: Fn(&str) -> bool + Send + Sync,
    C: Fn(&str, &[String]) -> bool + Send + Sync,
{
    pub fn new(need: N, cont: C) -> Self {
        Self { need, cont }
    }
}

impl<N, C> WatchPolicy for Predicates<N, C>
where
    N: Fn(&str) -> bool + Send + Sync,
    C: Fn(&str, &[String]) -> bool + Send + Sync,
{
    fn need_watch(&self, path: &str) -> bool {
        (self.need)(path)
    }

    fn cont_watch(&self, path: &str, children: &[String]) -> bool {
        (self.cont)(path, children)
    }
}

/// What to do when a child appears or disappears remotely.
#[async_trait]
pub trait ChildHandler: Send + Sync {
    async fn on_add(&self, engine: &mut SyncEngine, path: &str) -> Result<()>;

    async fn on_del(&self, engine: &mut SyncEngine, path: &str) -> Result<()>;
}

/// Children are leaf values: sync their data, delete their file.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataHandler;

#[async_trait]
impl ChildHandler for DataHandler {
    async fn on_add(&self, engine: &mut SyncEngine, path: &str) -> Result<()> {
        engine.sync_data(path).await
    }

    async fn on_del(&self, engine: &mut SyncEngine, path: &str) -> Result<()> {
        engine.remove_entry(path)
    }
}

/// Children are directories of leaf values.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubtreeHandler {
    /// Keep data watches on the grandchildren
    pub watch_data: bool,
}

impl SubtreeHandler {
    pub fn new(watch_data: bool) -> Self {
        Self { watch_data }
    }
}

#[async_trait]
impl ChildHandler for SubtreeHandler {
    async fn on_add(&self, engine: &mut SyncEngine, path: &str) -> Result<()> {
        info!("Added subtree: {}", path);
        engine
            .sync_children(path, ChildrenSync::new().watch_data(self.watch_data))
            .await
    }

    async fn on_del(&self, engine: &mut SyncEngine, path: &str) -> Result<()> {
        info!("Removed subtree: {}", path);
        engine.remove_subtree(path)
    }
}

/// Children are trace shards, each holding trace event names.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceShardHandler;

#[async_trait]
impl ChildHandler for TraceShardHandler {
    async fn on_add(&self, engine: &mut SyncEngine, path: &str) -> Result<()> {
        info!("Added trace shard: {}", path);
        engine
            .sync_children(path, ChildrenSync::new().handler(TraceEventHandler))
            .await
    }

    async fn on_del(&self, _engine: &mut SyncEngine, path: &str) -> Result<()> {
        // Shards are fixed; losing one means the namespace was tampered with.
        error!("Removed trace shard: {}", path);
        Ok(())
    }
}

/// Children are trace events named `<instance>,<timestamp>,<rest>`.
///
/// The event carries everything in its name, so the mirror holds an empty
/// file whose mtime is the event timestamp.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceEventHandler;

impl TraceEventHandler {
    /// Timestamp embedded in a trace event name, truncated to whole seconds.
    pub fn event_time(name: &str) -> Option<SystemTime> {
        let mut parts = name.splitn(3, ',');
        let _instance = parts.next()?;
        let timestamp: f64 = parts.next()?.parse().ok()?;
        parts.next()?;
        if !timestamp.is_finite() || timestamp < 0.0 {
            return None;
        }
        UNIX_EPOCH.checked_add(Duration::from_secs(timestamp.trunc() as u64))
    }
}

#[async_trait]
impl ChildHandler for TraceEventHandler {
    async fn on_add(&self, engine: &mut SyncEngine, path: &str) -> Result<()> {
        let name = path.rsplit('/').next().unwrap_or(path);
        let modified =
            Self::event_time(name).ok_or_else(|| SyncError::InvalidName(path.to_string()))?;
        engine.write_entry(path, b"", modified, crate::mirror::WriteMode::BestEffort)
    }

    async fn on_del(&self, engine: &mut SyncEngine, path: &str) -> Result<()> {
        engine.remove_entry(path)
    }
}

/// Options for one `sync_children` call.
#[derive(Clone)]
pub struct ChildrenSync {
    pub(crate) watch_data: bool,
    pub(crate) handler: Arc<dyn ChildHandler>,
    pub(crate) policy: Arc<dyn WatchPolicy>,
}

impl ChildrenSync {
    /// Leaf children, snapshot data, always watched.
    pub fn new() -> Self {
        Self {
            watch_data: false,
            handler: Arc::new(DataHandler),
            policy: Arc::new(AlwaysWatch),
        }
    }

    /// Keep renewing data watches on every child.
    pub fn watch_data(mut self, watch_data: bool) -> Self {
        self.watch_data = watch_data;
        self
    }

    pub fn handler(mut self, handler: impl ChildHandler + 'static) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    pub fn policy(mut self, policy: impl WatchPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Use a policy shared between several calls.
    pub fn shared_policy(mut self, policy: Arc<dyn WatchPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_watching_data(&self) -> bool {
        self.watch_data
    }
}

impl Default for ChildrenSync {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChildrenSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildrenSync")
            .field("watch_data", &self.watch_data)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_watch() {
        assert!(AlwaysWatch.need_watch("/any"));
        assert!(AlwaysWatch.cont_watch("/any", &[]));
    }

    #[test]
    fn test_predicates() {
        let policy = Predicates::new(
            |path: &str| path.starts_with("/active"),
            |_path: &str, children: &[String]| !children.iter().any(|c| c == "finished"),
        );
        assert!(policy.need_watch("/active/1"));
        assert!(!policy.need_watch("/archive/1"));
        assert!(policy.cont_watch("/x", &["running".to_string()]));
        assert!(!policy.cont_watch("/x", &["finished".to_string()]));
    }

    #[test]
    fn test_trace_event_time() {
        assert_eq!(
            TraceEventHandler::event_time("proid.app#0000000001,1500000000.75,host,scheduled"),
            Some(UNIX_EPOCH + Duration::from_secs(1_500_000_000))
        );
        assert_eq!(TraceEventHandler::event_time("no-commas"), None);
        assert_eq!(TraceEventHandler::event_time("a,notanumber,b"), None);
        assert_eq!(TraceEventHandler::event_time("a,12"), None);
        assert_eq!(TraceEventHandler::event_time("app#1,1e300,host,scheduled"), None);
        assert_eq!(TraceEventHandler::event_time("app#1,inf,host,scheduled"), None);
    }

    #[test]
    fn test_children_sync_defaults() {
        let opts = ChildrenSync::new();
        assert!(!opts.is_watching_data());
        assert!(opts.policy.need_watch("/x"));
        assert!(opts.watch_data(true).is_watching_data());
    }
}
