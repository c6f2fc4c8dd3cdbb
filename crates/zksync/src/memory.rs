//! In-memory coordinator for tests and snapshot mirroring.
//!
//! Keeps the namespace in a sorted map and honours the one-shot watch
//! semantics of the real service: every armed watch fires at most once and is
//! discarded after firing.

use crate::coordinator::{
    join_path, parent_path, CoordError, Coordinator, EventType, NodeStat, NodeValue, Result,
    SessionState, WatchEvent, WatchKind, WatchSender,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
struct Node {
    data: Option<Vec<u8>>,
    stat: NodeStat,
}

/// In-memory coordination namespace
pub struct InMemoryCoordinator {
    nodes: RwLock<BTreeMap<String, Node>>,
    data_watches: Mutex<HashMap<String, Vec<WatchSender>>>,
    child_watches: Mutex<HashMap<String, Vec<WatchSender>>>,
    session_listeners: Mutex<Vec<mpsc::UnboundedSender<SessionState>>>,
    /// Number of client calls served (reads, listings, armings)
    calls: AtomicUsize,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: None,
                stat: NodeStat::default(),
            },
        );
        Self {
            nodes: RwLock::new(nodes),
            data_watches: Mutex::new(HashMap::new()),
            child_watches: Mutex::new(HashMap::new()),
            session_listeners: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Create a node, creating missing ancestors without data.
    ///
    /// Creating an existing node replaces its data.
    pub fn create(&self, path: &str, data: Option<&[u8]>) {
        let path = Self::normalize_path(path);
        if let Some(parent) = parent_path(&path) {
            if !self.contains(parent) {
                self.create(parent, None);
            }
        }

        let existed = {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            nodes
                .insert(
                    path.clone(),
                    Node {
                        data: data.map(|d| d.to_vec()),
                        stat: NodeStat {
                            mtime_millis: Self::current_time_ms(),
                            ephemeral_owner: 0,
                        },
                    },
                )
                .is_some()
        };

        if existed {
            self.fire_data(&path, EventType::Changed);
        } else {
            self.fire_data(&path, EventType::Created);
            if let Some(parent) = parent_path(&path) {
                self.fire_children(parent, EventType::ChildrenChanged);
            }
        }
    }

    /// Replace the data of an existing node.
    pub fn set(&self, path: &str, data: Option<&[u8]>) -> Result<()> {
        let path = Self::normalize_path(path);
        {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            let node = nodes
                .get_mut(&path)
                .ok_or_else(|| CoordError::NoNode(path.clone()))?;
            node.data = data.map(|d| d.to_vec());
            node.stat.mtime_millis = Self::current_time_ms();
        }
        self.fire_data(&path, EventType::Changed);
        Ok(())
    }

    /// Delete a node and all of its descendants.
    pub fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if path == "/" {
            return Err(CoordError::Other("cannot delete root".into()));
        }

        let removed: Vec<String> = {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            if !nodes.contains_key(&path) {
                return Err(CoordError::NoNode(path));
            }
            let prefix = format!("{}/", path);
            let doomed: Vec<String> = nodes
                .keys()
                .filter(|k| **k == path || k.starts_with(&prefix))
                .cloned()
                .collect();
            for key in &doomed {
                nodes.remove(key);
            }
            doomed
        };

        // Deepest first, the way a recursive delete reaches the service.
        for node in removed.iter().rev() {
            self.fire_data(node, EventType::Deleted);
            self.fire_children(node, EventType::Deleted);
        }
        if let Some(parent) = parent_path(&path) {
            self.fire_children(parent, EventType::ChildrenChanged);
        }
        Ok(())
    }

    /// Set a specific mtime for a node (milliseconds since epoch).
    pub fn set_mtime(&self, path: &str, mtime_millis: u64) -> Result<()> {
        let path = Self::normalize_path(path);
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let node = nodes
            .get_mut(&path)
            .ok_or_else(|| CoordError::NoNode(path.clone()))?;
        node.stat.mtime_millis = mtime_millis;
        Ok(())
    }

    /// Report the session as permanently lost to every listener.
    pub fn lose_session(&self) {
        let listeners = self
            .session_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            let _ = listener.send(SessionState::Lost);
        }
    }

    /// Number of client calls served so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of armed, not yet fired, watches on a path.
    pub fn armed_watches(&self, path: &str, kind: WatchKind) -> usize {
        let path = Self::normalize_path(path);
        let watches = match kind {
            WatchKind::Data => &self.data_watches,
            WatchKind::Children => &self.child_watches,
        };
        watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&path)
            .map(|w| w.len())
            .unwrap_or(0)
    }

    fn contains(&self, path: &str) -> bool {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn current_time_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn normalize_path(path: &str) -> String {
        let trimmed = path.trim_matches('/');
        format!("/{}", trimmed)
    }

    fn arm(watches: &Mutex<HashMap<String, Vec<WatchSender>>>, path: &str, tx: WatchSender) {
        watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(path.to_string())
            .or_default()
            .push(tx);
    }

    fn fire(
        watches: &Mutex<HashMap<String, Vec<WatchSender>>>,
        path: &str,
        kind: WatchKind,
        event_type: EventType,
    ) {
        let armed = watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path)
            .unwrap_or_default();
        for tx in armed {
            // Receiver gone means the engine shut down.
            let _ = tx.send(WatchEvent {
                path: path.to_string(),
                kind,
                event_type,
            });
        }
    }

    fn fire_data(&self, path: &str, event_type: EventType) {
        Self::fire(&self.data_watches, path, WatchKind::Data, event_type);
    }

    fn fire_children(&self, path: &str, event_type: EventType) {
        Self::fire(&self.child_watches, path, WatchKind::Children, event_type);
    }

    fn children_of(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
        let prefix = join_path(path, "");
        nodes
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(|rest| rest.to_string())
            .collect()
    }
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn get(&self, path: &str) -> Result<NodeValue> {
        self.record_call();
        let path = Self::normalize_path(path);
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes
            .get(&path)
            .map(|node| (node.data.clone(), node.stat))
            .ok_or(CoordError::NoNode(path))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.record_call();
        let path = Self::normalize_path(path);
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        if !nodes.contains_key(&path) {
            return Err(CoordError::NoNode(path));
        }
        Ok(Self::children_of(&nodes, &path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.record_call();
        Ok(self.contains(&Self::normalize_path(path)))
    }

    async fn get_and_watch_data(&self, path: &str, tx: WatchSender) -> Result<Option<NodeValue>> {
        self.record_call();
        let path = Self::normalize_path(path);
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        Self::arm(&self.data_watches, &path, tx);
        Ok(nodes.get(&path).map(|node| (node.data.clone(), node.stat)))
    }

    async fn get_and_watch_children(&self, path: &str, tx: WatchSender) -> Result<Vec<String>> {
        self.record_call();
        let path = Self::normalize_path(path);
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        if !nodes.contains_key(&path) {
            return Err(CoordError::NoNode(path));
        }
        Self::arm(&self.child_watches, &path, tx);
        Ok(Self::children_of(&nodes, &path))
    }

    fn session_events(&self) -> mpsc::UnboundedReceiver<SessionState> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SessionState::Connected);
        self.session_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }
}
