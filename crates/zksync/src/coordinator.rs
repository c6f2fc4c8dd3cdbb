//! Coordinator trait abstraction over the coordination service client.
//!
//! Implementations:
//! - `InMemoryCoordinator` - For testing and snapshot mirroring
//!
//! Watches are one-shot: arming one registers interest in the next change of a
//! node, and the fired `WatchEvent` is delivered on the channel supplied at
//! arming time. The engine re-arms after every delivery it wants to renew.

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Session lost")]
    SessionLost,

    #[error("Coordinator error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CoordError>;

/// Node metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeStat {
    /// Last modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// Session owning the node (0 for persistent nodes)
    pub ephemeral_owner: u64,
}

impl NodeStat {
    /// Remote modification time as a `SystemTime`.
    pub fn modified(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.mtime_millis)
    }
}

/// What happened to a watched node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Created,
    Deleted,
    Changed,
    ChildrenChanged,
}

/// Which kind of subscription fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    Data,
    Children,
}

/// A fired one-shot watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchKind,
    pub event_type: EventType,
}

/// Session lifecycle transitions reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// Connection interrupted, session may still be recovered by the client
    Suspended,
    /// Session expired or closed; all outstanding watches are gone
    Lost,
}

/// Sender half handed to the coordinator when arming a watch.
pub type WatchSender = mpsc::UnboundedSender<WatchEvent>;

/// Node value as returned by reads: data (absent for null nodes) plus stat.
pub type NodeValue = (Option<Vec<u8>>, NodeStat);

/// Coordination service client as seen by the sync engine.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Read node data and stat. Missing node is `CoordError::NoNode`.
    async fn get(&self, path: &str) -> Result<NodeValue>;

    /// List child names (not full paths).
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    /// Check if the node exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Read node data and arm a one-shot watch on it.
    ///
    /// Returns `None` when the node does not exist; the watch is armed anyway
    /// and fires with `EventType::Created` once it appears.
    async fn get_and_watch_data(&self, path: &str, tx: WatchSender) -> Result<Option<NodeValue>>;

    /// List children and arm a one-shot children watch.
    async fn get_and_watch_children(&self, path: &str, tx: WatchSender) -> Result<Vec<String>>;

    /// Register a listener for session state transitions.
    fn session_events(&self) -> mpsc::UnboundedReceiver<SessionState>;
}

/// Join a child name onto a coordination path.
pub fn join_path(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    format!("{}/{}", parent, child)
}

/// Parent of a coordination path (`None` for the root).
pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(pos) => Some(&trimmed[..pos]),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "servers"), "/servers");
        assert_eq!(join_path("/cell/servers", "host1"), "/cell/servers/host1");
        assert_eq!(join_path("/cell/", "x"), "/cell/x");
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/"), None);
        assert_eq!(parent_path("/servers"), Some("/"));
        assert_eq!(parent_path("/cell/servers/host1"), Some("/cell/servers"));
    }

    #[test]
    fn test_stat_modified() {
        let stat = NodeStat {
            mtime_millis: 1_500,
            ephemeral_owner: 0,
        };
        assert_eq!(stat.modified(), UNIX_EPOCH + Duration::from_millis(1_500));
    }
}
