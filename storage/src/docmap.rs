//! Hot-reloadable mapping from indexed document ids to document metadata.
//!
//! Readers grab the current `Arc<DocumentMap>` and keep it for the whole
//! query; a refresher task publishes newer versions by swapping the pointer.

use crate::snapshot::{DocumentMapRecord, SnapshotError, SnapshotManager};
use crate::store::StoreError;
use async_trait::async_trait;
use pagecite_core::config::DocumentMapConfig;
use pagecite_core::model::DocumentInfo;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentMap {
    version: u64,
    documents: HashMap<String, DocumentInfo>,
}

impl DocumentMap {
    pub fn new(version: u64, documents: impl IntoIterator<Item = DocumentInfo>) -> Self {
        Self {
            version,
            documents: documents
                .into_iter()
                .map(|doc| (doc.id.clone(), doc))
                .collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, document_id: &str) -> Option<&DocumentInfo> {
        self.documents.get(document_id)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl From<DocumentMapRecord> for DocumentMap {
    fn from(record: DocumentMapRecord) -> Self {
        Self::new(record.version, record.documents)
    }
}

#[derive(Debug, Default)]
pub struct DocumentMapHandle {
    current: RwLock<Arc<DocumentMap>>,
}

impl DocumentMapHandle {
    pub fn new(initial: DocumentMap) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Current snapshot. The lock is only held for the pointer clone.
    pub fn load(&self) -> Arc<DocumentMap> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn version(&self) -> u64 {
        self.load().version
    }

    /// Swap in `next` if it is newer than the current map. Returns whether it was published.
    pub fn publish(&self, next: DocumentMap) -> bool {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if next.version <= guard.version {
            return false;
        }
        debug!(from = guard.version, to = next.version, "publishing document map");
        *guard = Arc::new(next);
        true
    }
}

/// Where newer document maps come from.
#[async_trait]
pub trait DocumentMapSource: Send + Sync {
    /// Versions currently available, in any order.
    async fn versions(&self) -> Result<Vec<u64>, StoreError>;
    async fn load(&self, version: u64) -> Result<DocumentMap, StoreError>;
}

/// Document maps stored as rkyv snapshots in a directory.
pub struct SnapshotDirSource {
    manager: SnapshotManager,
}

impl SnapshotDirSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            manager: SnapshotManager::new(dir),
        }
    }

    pub fn manager(&self) -> &SnapshotManager {
        &self.manager
    }
}

impl From<SnapshotError> for StoreError {
    fn from(err: SnapshotError) -> Self {
        StoreError::Snapshot(err.to_string())
    }
}

#[async_trait]
impl DocumentMapSource for SnapshotDirSource {
    async fn versions(&self) -> Result<Vec<u64>, StoreError> {
        Ok(self.manager.versions().await?)
    }

    async fn load(&self, version: u64) -> Result<DocumentMap, StoreError> {
        Ok(self.manager.read_snapshot(version).await?.into())
    }
}

/// Check the source once and publish the newest loadable map that is newer
/// than the current one.
pub async fn refresh_once(
    handle: &DocumentMapHandle,
    source: &dyn DocumentMapSource,
) -> Result<bool, StoreError> {
    refresh_skipping(handle, source, &mut HashSet::new()).await
}

/// Newer versions are tried newest first. A version that fails to load is
/// added to `rejected` and never tried again by the same caller.
async fn refresh_skipping(
    handle: &DocumentMapHandle,
    source: &dyn DocumentMapSource,
    rejected: &mut HashSet<u64>,
) -> Result<bool, StoreError> {
    let current = handle.version();
    let mut newer: Vec<u64> = source
        .versions()
        .await?
        .into_iter()
        .filter(|version| *version > current && !rejected.contains(version))
        .collect();
    newer.sort_unstable_by(|a, b| b.cmp(a));
    newer.dedup();

    let mut last_error = None;
    for version in newer {
        match source.load(version).await {
            Ok(map) => return Ok(handle.publish(map)),
            Err(err) => {
                warn!(version, error = %err, "document map snapshot rejected");
                rejected.insert(version);
                last_error = Some(err);
            }
        }
    }
    last_error.map_or(Ok(false), Err)
}

/// Poll `source` every `interval` and republish newer versions until the task is aborted.
pub fn spawn_refresher(
    handle: Arc<DocumentMapHandle>,
    source: Arc<dyn DocumentMapSource>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rejected = HashSet::new();
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match refresh_skipping(&handle, source.as_ref(), &mut rejected).await {
                Ok(true) => info!(version = handle.version(), "document map reloaded"),
                Ok(false) => {}
                Err(err) => warn!(error = %err, "document map refresh failed"),
            }
        }
    })
}

/// Start hot reload from a configured snapshot directory, if one is set.
pub fn start_from_config(
    config: &DocumentMapConfig,
) -> Option<(Arc<DocumentMapHandle>, JoinHandle<()>)> {
    let dir = config.snapshot_dir.as_deref()?;
    let handle = Arc::new(DocumentMapHandle::default());
    let task = spawn_refresher(
        handle.clone(),
        Arc::new(SnapshotDirSource::new(dir)),
        Duration::from_millis(config.refresh_interval_ms),
    );
    info!(snapshot_dir = dir, "document map hot reload started");
    Some((handle, task))
}
