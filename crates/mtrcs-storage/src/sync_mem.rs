use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mtrcs_common::types::{CounterMetric, GaugeMetric, MetricRecord, Snapshot};
use tokio::sync::Mutex;

use crate::error::{Result, StorageError};
use crate::mem::{write_snapshot, MemStorage};
use crate::{MetricGetter, MetricUpdater, SnapshotStore, Storage};

/// [`MemStorage`] that writes its full snapshot to `path` after every
/// successful update. Used when periodic snapshotting is disabled.
///
/// The file write runs on the blocking pool. `persist_lock` is held from
/// taking the snapshot until the write lands, so concurrent updates reach the
/// disk in the order their snapshots were taken and the file always ends at
/// the newest state.
#[derive(Debug)]
pub struct SyncMemStorage {
    inner: MemStorage,
    path: PathBuf,
    persist_lock: Mutex<()>,
}

impl SyncMemStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: MemStorage::new(),
            path: path.into(),
            persist_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.inner.snapshot();
        let path = self.path.clone();
        let written = tokio::task::spawn_blocking(move || write_snapshot(&path, &snapshot))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))
            .and_then(|res| res);
        written.inspect_err(|e| {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to persist snapshot");
        })
    }
}

#[async_trait]
impl MetricUpdater for SyncMemStorage {
    async fn update_gauge(&self, name: &str, value: f64) -> Result<()> {
        self.inner.update_gauge(name, value).await?;
        self.persist().await
    }

    async fn update_counter(&self, name: &str, delta: i64) -> Result<i64> {
        let total = self.inner.update_counter(name, delta).await?;
        self.persist().await?;
        Ok(total)
    }

    async fn update_batch(&self, records: &[MetricRecord]) -> Result<Vec<MetricRecord>> {
        let resolved = self.inner.update_batch(records).await?;
        self.persist().await?;
        Ok(resolved)
    }
}

#[async_trait]
impl MetricGetter for SyncMemStorage {
    async fn get_gauge(&self, name: &str) -> Result<GaugeMetric> {
        self.inner.get_gauge(name).await
    }

    async fn get_counter(&self, name: &str) -> Result<CounterMetric> {
        self.inner.get_counter(name).await
    }

    async fn get_all_gauges(&self) -> Result<Vec<GaugeMetric>> {
        self.inner.get_all_gauges().await
    }

    async fn get_all_counters(&self) -> Result<Vec<CounterMetric>> {
        self.inner.get_all_counters().await
    }
}

impl Storage for SyncMemStorage {}

impl SnapshotStore for SyncMemStorage {
    fn snapshot(&self) -> Snapshot {
        self.inner.snapshot()
    }

    fn save(&self, path: &Path) -> Result<()> {
        self.inner.save(path)
    }

    fn restore(&self, path: &Path) -> Result<()> {
        self.inner.restore(path)
    }
}
