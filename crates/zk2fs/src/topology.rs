//! Wiring of configured subtrees onto the sync engine.

use std::sync::Arc;

use tracing::{info, warn};
use zksync::{
    ChildrenSync, Coordinator, SubtreeHandler, SyncEngine, SyncError, TraceShardHandler,
    WatchPolicy,
};

use crate::config::{Config, MirrorKind, MirrorSpec};

/// Policy that leaves static prefixes unwatched.
///
/// Paths under a static prefix are synced once and marked done.
#[derive(Debug, Clone)]
pub struct StaticPrefixes {
    config: Config,
}

impl StaticPrefixes {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl WatchPolicy for StaticPrefixes {
    fn need_watch(&self, path: &str) -> bool {
        !self.config.is_static(path)
    }

    fn cont_watch(&self, path: &str, _children: &[String]) -> bool {
        !self.config.is_static(path)
    }
}

/// Reconcile options for one configured subtree.
pub fn children_sync(spec: &MirrorSpec, policy: Arc<dyn WatchPolicy>) -> ChildrenSync {
    let opts = ChildrenSync::new().shared_policy(policy);
    match spec.kind {
        MirrorKind::Leaves => opts.watch_data(spec.watch_data),
        MirrorKind::Subtrees => opts.handler(SubtreeHandler::new(spec.watch_data)),
        MirrorKind::TraceShards => opts.handler(TraceShardHandler),
    }
}

/// Run the initial pass over every configured subtree.
pub async fn sync_all(engine: &mut SyncEngine, config: &Config) -> Result<(), SyncError> {
    let policy: Arc<dyn WatchPolicy> = Arc::new(StaticPrefixes::new(config.clone()));

    for spec in &config.mirrors {
        if !engine.coordinator().exists(&spec.path).await? {
            warn!("{} does not exist yet, mirroring it empty", spec.path);
        }
        info!("Mirroring {} ({:?})", spec.path, spec.kind);
        engine
            .sync_children(&spec.path, children_sync(spec, Arc::clone(&policy)))
            .await?;
    }
    Ok(())
}
