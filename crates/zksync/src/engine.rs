//! SyncEngine: mirrors a coordination namespace onto local disk.
//!
//! The engine works as follows:
//!
//! 1. A caller asks for a subtree with `sync_children` (and optionally data
//!    watches on its children) and for single nodes with `sync_data`
//! 2. Each call reads the remote state, arms one-shot watches where the
//!    strategies ask for them, and reconciles the local mirror
//! 3. Fired watches land on a single channel; `run` drains it one event at a
//!    time, re-reads the node, re-arms the watch and reconciles again
//! 4. `mark_ready` ends the bootstrap pass; from then on every mutation bumps
//!    the root `.modified` marker
//!
//! All state lives in the engine and every operation takes `&mut self`, so
//! deliveries are serialized by construction.

use crate::coordinator::{
    join_path, CoordError, Coordinator, EventType, NodeStat, SessionState, WatchEvent, WatchKind,
    WatchSender,
};
use crate::diff::diff_children;
use crate::events::{EventBus, MirrorEvent};
use crate::mirror::{Mirror, MirrorError, WriteMode};
use crate::strategy::ChildrenSync;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordError),

    #[error("Mirror error: {0}")]
    Mirror(#[from] MirrorError),

    #[error("Coordination session lost")]
    SessionLost,

    #[error("Invalid node name: {0}")]
    InvalidName(String),

    #[error("Watch channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Whether a data subscription is renewed after a delivery.
///
/// The third outcome, a fault, is the `Err` side of the surrounding `Result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Renew,
    Drop,
}

/// One delivery of a node's value to the data synchronizer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataDelivery {
    /// Node data, absent for missing or null nodes
    pub data: Option<Vec<u8>>,
    /// Node stat, absent for missing nodes
    pub stat: Option<NodeStat>,
    /// Event that caused the delivery; `None` for the initial read
    pub event: Option<EventType>,
}

impl DataDelivery {
    pub fn new(data: Option<Vec<u8>>, stat: Option<NodeStat>, event: Option<EventType>) -> Self {
        Self { data, stat, event }
    }

    fn is_gone(&self) -> bool {
        match self.event {
            Some(EventType::Deleted) => true,
            None => self.data.is_none() && self.stat.is_none(),
            Some(_) => false,
        }
    }
}

/// What one reconciliation of a parent did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Children passed to `on_add` as new
    pub added: Vec<String>,
    /// Children passed to `on_del`
    pub removed: Vec<String>,
    /// Children present on both sides and synced on the first pass
    pub synced_common: Vec<String>,
    /// Result of the continue-watch decision
    pub cont: bool,
}

impl Reconciliation {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || !self.synced_common.is_empty()
    }
}

enum Next {
    Session(Option<SessionState>),
    Watch(Option<WatchEvent>),
}

/// Coordination namespace to filesystem synchronizer.
pub struct SyncEngine {
    coordinator: Arc<dyn Coordinator>,
    mirror: Mirror,
    events: Arc<EventBus>,
    /// Paths whose data watch is to be renewed
    watches: HashSet<String>,
    /// Parents whose common children were synced once
    processed_once: HashSet<String>,
    ready: bool,
    /// Paths holding an armed data watch at the coordinator
    armed_data: HashSet<String>,
    /// Parents holding an armed children watch, with their reconcile options
    armed_children: HashMap<String, ChildrenSync>,
    watch_tx: WatchSender,
    watch_rx: mpsc::UnboundedReceiver<WatchEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionState>,
}

impl SyncEngine {
    /// Create an engine mirroring into `root`.
    ///
    /// Registers the engine's session listener on the coordinator.
    pub fn new(coordinator: Arc<dyn Coordinator>, root: impl Into<PathBuf>) -> Result<Self> {
        let mirror = Mirror::new(root);
        mirror.mkdir("/")?;

        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let session_rx = coordinator.session_events();

        Ok(Self {
            coordinator,
            mirror,
            events: Arc::new(EventBus::new()),
            watches: HashSet::new(),
            processed_once: HashSet::new(),
            ready: false,
            armed_data: HashSet::new(),
            armed_children: HashMap::new(),
            watch_tx,
            watch_rx,
            session_rx,
        })
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }

    /// Request a renewing data watch for `path` on its next `sync_data`.
    pub fn watch(&mut self, path: &str) {
        self.watches.insert(path.to_string());
    }

    /// Stop renewing the data watch for `path`.
    pub fn unwatch(&mut self, path: &str) {
        self.watches.remove(path);
    }

    pub fn is_watched(&self, path: &str) -> bool {
        self.watches.contains(path)
    }

    pub fn watched_paths(&self) -> impl Iterator<Item = &str> {
        self.watches.iter().map(|s| s.as_str())
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Mark the initial population as complete.
    ///
    /// Always bumps the `.modified` marker.
    pub fn mark_ready(&mut self) -> Result<()> {
        self.ready = true;
        self.update_last()?;
        self.events.emit(MirrorEvent::Ready);
        info!("Mirror ready: {:?}", self.mirror.root());
        Ok(())
    }

    fn update_last(&self) -> Result<()> {
        if self.ready {
            self.mirror.touch_modified()?;
        }
        Ok(())
    }

    /// Write a leaf value into the mirror.
    pub fn write_entry(
        &self,
        path: &str,
        data: &[u8],
        modified: SystemTime,
        mode: WriteMode,
    ) -> Result<()> {
        self.mirror.write(path, data, modified, mode)?;
        self.events.emit(MirrorEvent::Written {
            path: path.to_string(),
            size: data.len(),
        });
        Ok(())
    }

    /// Remove a leaf value from the mirror; already absent is fine.
    pub fn remove_entry(&self, path: &str) -> Result<()> {
        if self.mirror.remove(path)? {
            self.events.emit(MirrorEvent::Removed {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    /// Remove a mirrored subtree and forget its subscriptions.
    pub fn remove_subtree(&mut self, path: &str) -> Result<()> {
        let prefix = join_path(path, "");
        let inside = |p: &String| p == path || p.starts_with(&prefix);

        self.watches.retain(|p| !inside(p));
        self.armed_children.retain(|p, _| !inside(p));
        self.processed_once.retain(|p| !inside(p));
        self.armed_data.retain(|p| !inside(p));

        if self.mirror.remove_tree(path)? {
            self.events.emit(MirrorEvent::Removed {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data synchronizer
    // ------------------------------------------------------------------

    /// Sync one node's data into its mirror file.
    ///
    /// Watched paths get a renewing data watch (arming twice is a no-op);
    /// other paths are fetched once.
    pub async fn sync_data(&mut self, path: &str) -> Result<()> {
        if self.watches.contains(path) {
            if self.armed_data.contains(path) {
                debug!("Data watch already armed on {}", path);
                return Ok(());
            }

            debug!("Establish data watch on: {}", path);
            let delivery = match self
                .coordinator
                .get_and_watch_data(path, self.watch_tx.clone())
                .await?
            {
                Some((data, stat)) => DataDelivery::new(data, Some(stat), None),
                None => DataDelivery::default(),
            };
            return self.deliver_data(path, delivery);
        }

        match self.coordinator.get(path).await {
            Ok((data, stat)) => {
                let data = data.unwrap_or_default();
                self.write_entry(path, &data, stat.modified(), WriteMode::Strict)?;
            }
            Err(CoordError::NoNode(_)) => {
                info!("Node does not exist: {}", path);
                self.remove_entry(path)?;
            }
            Err(e) => return Err(e.into()),
        }
        self.update_last()
    }

    /// Apply one data delivery to the mirror.
    ///
    /// A missing node (or a deletion event) removes the mirror file and the
    /// path from the watch set. Anything else is written with the remote
    /// mtime. Renewal follows watch set membership.
    pub fn on_data(&mut self, path: &str, delivery: DataDelivery) -> Result<WatchAction> {
        if delivery.is_gone() {
            if delivery.event == Some(EventType::Deleted) {
                info!("Node removed: {}", path);
            } else {
                info!("Node does not exist: {}", path);
            }
            self.watches.remove(path);
            self.remove_entry(path)?;
        } else {
            let modified = delivery
                .stat
                .map(|stat| stat.modified())
                .unwrap_or_else(SystemTime::now);
            let data = delivery.data.unwrap_or_default();
            self.write_entry(path, &data, modified, WriteMode::Strict)?;
        }

        let renew = self.watches.contains(path);
        info!("Renew watch on {} - {}", path, renew);
        Ok(if renew {
            WatchAction::Renew
        } else {
            WatchAction::Drop
        })
    }

    fn deliver_data(&mut self, path: &str, delivery: DataDelivery) -> Result<()> {
        match self.on_data(path, delivery)? {
            WatchAction::Renew => {
                self.armed_data.insert(path.to_string());
            }
            WatchAction::Drop => {
                self.armed_data.remove(path);
                self.events.emit(MirrorEvent::WatchDropped {
                    path: path.to_string(),
                });
            }
        }
        self.update_last()
    }

    async fn on_data_fired(&mut self, event: WatchEvent) -> Result<()> {
        let path = event.path;
        if !self.armed_data.remove(&path) {
            debug!("Ignoring stale data watch on {}", path);
            return Ok(());
        }

        // A deleted node may already be back by the time the fire is handled.
        let recreated = event.event_type == EventType::Deleted
            && self.watches.contains(&path)
            && self.coordinator.exists(&path).await?;

        let delivery = if event.event_type == EventType::Deleted && !recreated {
            DataDelivery::new(None, None, Some(EventType::Deleted))
        } else if !self.watches.contains(&path) {
            info!("Watch on {} cancelled", path);
            return Ok(());
        } else {
            let event_type = if recreated {
                info!("Node recreated: {}", path);
                EventType::Created
            } else {
                event.event_type
            };
            match self
                .coordinator
                .get_and_watch_data(&path, self.watch_tx.clone())
                .await?
            {
                Some((data, stat)) => DataDelivery::new(data, Some(stat), Some(event_type)),
                // Gone again before we could read it.
                None => DataDelivery::new(None, None, Some(EventType::Deleted)),
            }
        };

        self.deliver_data(&path, delivery)
    }

    // ------------------------------------------------------------------
    // Children reconciler
    // ------------------------------------------------------------------

    /// Sync the children of `path` into the mirror directory of `path`.
    ///
    /// The children subscription is kept if either `need_watch` or
    /// `cont_watch` asks for it; otherwise the directory is marked done and
    /// never looked at again.
    pub async fn sync_children(&mut self, path: &str, opts: ChildrenSync) -> Result<()> {
        info!(
            "sync children: zk = {}, watch_data: {}",
            path, opts.watch_data
        );

        self.mirror.mkdir(path)?;
        if self.mirror.is_done(path) {
            info!("Found done file in {}, nothing to watch.", path);
            return Ok(());
        }

        let need_watch = opts.policy.need_watch(path);
        info!("Need watch on {}: {}", path, need_watch);

        let keep = if need_watch {
            self.arm_children(path, &opts).await?;
            true
        } else {
            let children = match self.coordinator.get_children(path).await {
                Ok(children) => children,
                Err(CoordError::NoNode(_)) => Vec::new(),
                Err(e) => return Err(e.into()),
            };

            let result = self.on_children(path, children, &opts).await?;
            if result.cont {
                self.arm_children(path, &opts).await?;
            }
            if result.changed() {
                self.update_last()?;
            }
            result.cont
        };

        if !keep {
            self.mirror.mark_done(path)?;
            self.events.emit(MirrorEvent::Done {
                path: path.to_string(),
            });
            info!("Marked {} as done", path);
        }
        Ok(())
    }

    /// Reconcile the mirror directory of `path` against a remote listing.
    ///
    /// Removed children always go to `on_del`, new children always go to
    /// `on_add`; children present on both sides are synced only on the
    /// first reconciliation of `path`.
    pub async fn on_children(
        &mut self,
        path: &str,
        mut children: Vec<String>,
        opts: &ChildrenSync,
    ) -> Result<Reconciliation> {
        children.sort();
        let local = self.mirror.list(path)?;

        // Hidden names collide with the mirror's own markers and temporaries.
        let (hidden, visible): (Vec<String>, Vec<String>) =
            children.iter().cloned().partition(|name| name.starts_with('.'));
        for name in &hidden {
            warn!("Skipping hidden node: {}", join_path(path, name));
        }
        let diff = diff_children(&visible, &local);

        for name in &diff.remove {
            let child = join_path(path, name);
            info!("Delete: {}", child);
            self.watches.remove(&child);
            opts.handler.on_del(self, &child).await?;
        }

        let synced_common = if self.processed_once.insert(path.to_string()) {
            diff.common
        } else {
            Vec::new()
        };

        for name in &synced_common {
            let child = join_path(path, name);
            info!("Common: {}", child);
            if opts.watch_data {
                self.watches.insert(child.clone());
            }
            opts.handler.on_add(self, &child).await?;
        }

        for name in &diff.add {
            let child = join_path(path, name);
            info!("Add: {}", child);
            if opts.watch_data {
                self.watches.insert(child.clone());
            }
            opts.handler.on_add(self, &child).await?;
        }

        let cont = opts.policy.cont_watch(path, &children);
        Ok(Reconciliation {
            added: diff.add,
            removed: diff.remove,
            synced_common,
            cont,
        })
    }

    /// Arm the children watch on `path` unless one is already armed.
    ///
    /// The subscription survives its initial delivery regardless of
    /// `cont_watch`: the caller already decided it is needed.
    async fn arm_children(&mut self, path: &str, opts: &ChildrenSync) -> Result<()> {
        if self.armed_children.contains_key(path) {
            debug!("Children watch already armed on {}", path);
            return Ok(());
        }

        debug!("Establish children watch on: {}", path);
        self.watch_children(path, opts, true).await
    }

    async fn watch_children(&mut self, path: &str, opts: &ChildrenSync, pinned: bool) -> Result<()> {
        let children = match self
            .coordinator
            .get_and_watch_children(path, self.watch_tx.clone())
            .await
        {
            Ok(children) => children,
            Err(CoordError::NoNode(_)) => {
                info!("Node does not exist: {}, children watch stopped", path);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // Registered before reconciling so nested calls see it armed.
        self.armed_children.insert(path.to_string(), opts.clone());

        let result = self.on_children(path, children, opts).await?;
        let renew = pinned || result.cont;
        if !renew {
            self.armed_children.remove(path);
        }
        info!("Renew children watch on {} - {}", path, renew);

        if result.changed() {
            self.update_last()?;
        }
        Ok(())
    }

    async fn on_children_fired(&mut self, event: WatchEvent) -> Result<()> {
        let path = event.path;
        let Some(opts) = self.armed_children.remove(&path) else {
            debug!("Ignoring stale children watch on {}", path);
            return Ok(());
        };

        // Re-list even after a deletion: the node may have been recreated
        // since. A node that is still gone ends the watch.
        if event.event_type == EventType::Deleted {
            info!("Node removed: {}, re-listing", path);
        }
        self.watch_children(&path, &opts, false).await
    }

    // ------------------------------------------------------------------
    // Dispatcher
    // ------------------------------------------------------------------

    async fn dispatch(&mut self, event: WatchEvent) -> Result<()> {
        debug!("Watch fired: {:?} {:?} on {}", event.kind, event.event_type, event.path);
        match event.kind {
            WatchKind::Data => self.on_data_fired(event).await,
            WatchKind::Children => self.on_children_fired(event).await,
        }
    }

    fn on_session(&self, state: SessionState) -> Result<()> {
        match state {
            SessionState::Connected => {
                debug!("Coordination session connected");
                Ok(())
            }
            SessionState::Suspended => {
                warn!("Coordination session suspended");
                Ok(())
            }
            SessionState::Lost => {
                error!("Coordination session lost");
                Err(SyncError::SessionLost)
            }
        }
    }

    /// Handle every delivery already queued, then return.
    ///
    /// Returns the number of watch events handled.
    pub async fn process_pending(&mut self) -> Result<usize> {
        let mut handled = 0;
        loop {
            while let Ok(state) = self.session_rx.try_recv() {
                self.on_session(state)?;
            }
            match self.watch_rx.try_recv() {
                Ok(event) => {
                    self.dispatch(event).await?;
                    handled += 1;
                }
                Err(_) => return Ok(handled),
            }
        }
    }

    /// Handle deliveries one at a time until a fatal error.
    ///
    /// Session loss and any error raised while handling a delivery end the
    /// loop; subscriptions cannot be trusted after either, so the caller is
    /// expected to exit and resynchronize from scratch.
    pub async fn run(&mut self) -> Result<()> {
        info!("Dispatching watch events");
        loop {
            let next = tokio::select! {
                biased;
                state = self.session_rx.recv() => Next::Session(state),
                event = self.watch_rx.recv() => Next::Watch(event),
            };

            match next {
                Next::Session(Some(state)) => self.on_session(state)?,
                Next::Session(None) => {
                    error!("Session listener closed");
                    return Err(SyncError::SessionLost);
                }
                Next::Watch(Some(event)) => {
                    let path = event.path.clone();
                    if let Err(e) = self.dispatch(event).await {
                        error!("Unhandled error in watch callback on {}: {}", path, e);
                        return Err(e);
                    }
                }
                Next::Watch(None) => return Err(SyncError::ChannelClosed),
            }
        }
    }
}
