use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use mtrcs_common::types::{
    check_gauge_value, CounterMetric, GaugeMetric, MetricKind, MetricRecord, RecordError,
    Snapshot,
};

use crate::error::{Result, StorageError};
use crate::{MetricGetter, MetricUpdater, SnapshotStore, Storage};

#[derive(Debug, Default)]
struct Maps {
    gauges: HashMap<String, f64>,
    counters: HashMap<String, i64>,
}

/// In-process metric store.
///
/// One `RwLock` guards both maps: updates take it exclusively, reads share it,
/// and bulk reads copy out while holding it so callers never observe a
/// half-applied update.
#[derive(Debug, Default)]
pub struct MemStorage {
    maps: RwLock<Maps>,
    save_lock: Mutex<()>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let storage = Self::new();
        storage.replace(snapshot);
        storage
    }

    fn read(&self) -> RwLockReadGuard<'_, Maps> {
        self.maps.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Maps> {
        self.maps.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn replace(&self, snapshot: Snapshot) {
        let mut maps = self.write();
        maps.gauges = snapshot.gauge_metrics.into_iter().collect();
        maps.counters = snapshot.counter_metrics.into_iter().collect();
    }

    fn add_counter(current: Option<i64>, name: &str, delta: i64) -> Result<i64> {
        current
            .unwrap_or(0)
            .checked_add(delta)
            .ok_or_else(|| StorageError::CounterOverflow {
                name: name.to_string(),
            })
    }
}

#[async_trait]
impl MetricUpdater for MemStorage {
    async fn update_gauge(&self, name: &str, value: f64) -> Result<()> {
        check_gauge_value(value)?;
        self.write().gauges.insert(name.to_string(), value);
        tracing::debug!(name, value, "Gauge updated");
        Ok(())
    }

    async fn update_counter(&self, name: &str, delta: i64) -> Result<i64> {
        let mut maps = self.write();
        let total = Self::add_counter(maps.counters.get(name).copied(), name, delta)?;
        maps.counters.insert(name.to_string(), total);
        tracing::debug!(name, delta, total, "Counter updated");
        Ok(total)
    }

    async fn update_batch(&self, records: &[MetricRecord]) -> Result<Vec<MetricRecord>> {
        for record in records {
            record.validate()?;
        }

        let mut maps = self.write();
        // Stage every counter first so an overflow leaves the maps untouched.
        let mut staged: HashMap<&str, i64> = HashMap::new();
        let mut resolved = Vec::with_capacity(records.len());
        for record in records {
            match record.kind {
                MetricKind::Gauge => resolved.push(record.clone()),
                MetricKind::Counter => {
                    let name = record.name.as_str();
                    let current = staged
                        .get(name)
                        .copied()
                        .or_else(|| maps.counters.get(name).copied());
                    let delta = record.delta.ok_or_else(|| missing_delta(record))?;
                    let total = Self::add_counter(current, name, delta)?;
                    staged.insert(name, total);
                    resolved.push(MetricRecord::counter(name, total));
                }
            }
        }

        for record in &resolved {
            match (record.kind, record.value, record.delta) {
                (MetricKind::Gauge, Some(value), _) => {
                    maps.gauges.insert(record.name.clone(), value);
                }
                (MetricKind::Counter, _, Some(total)) => {
                    maps.counters.insert(record.name.clone(), total);
                }
                _ => {}
            }
        }
        tracing::debug!(records = records.len(), "Batch applied");
        Ok(resolved)
    }
}

fn missing_delta(record: &MetricRecord) -> StorageError {
    RecordError::MissingField {
        name: record.name.clone(),
        kind: record.kind,
        field: "delta",
    }
    .into()
}

#[async_trait]
impl MetricGetter for MemStorage {
    async fn get_gauge(&self, name: &str) -> Result<GaugeMetric> {
        self.read()
            .gauges
            .get(name)
            .map(|&value| GaugeMetric {
                name: name.to_string(),
                value,
            })
            .ok_or_else(|| StorageError::NoSuchMetric {
                kind: MetricKind::Gauge,
                name: name.to_string(),
            })
    }

    async fn get_counter(&self, name: &str) -> Result<CounterMetric> {
        self.read()
            .counters
            .get(name)
            .map(|&value| CounterMetric {
                name: name.to_string(),
                value,
            })
            .ok_or_else(|| StorageError::NoSuchMetric {
                kind: MetricKind::Counter,
                name: name.to_string(),
            })
    }

    async fn get_all_gauges(&self) -> Result<Vec<GaugeMetric>> {
        let maps = self.read();
        Ok(maps
            .gauges
            .iter()
            .map(|(name, &value)| GaugeMetric {
                name: name.clone(),
                value,
            })
            .collect())
    }

    async fn get_all_counters(&self) -> Result<Vec<CounterMetric>> {
        let maps = self.read();
        Ok(maps
            .counters
            .iter()
            .map(|(name, &value)| CounterMetric {
                name: name.clone(),
                value,
            })
            .collect())
    }
}

impl Storage for MemStorage {}

impl SnapshotStore for MemStorage {
    fn snapshot(&self) -> Snapshot {
        let maps = self.read();
        Snapshot {
            gauge_metrics: maps.gauges.iter().map(|(k, &v)| (k.clone(), v)).collect(),
            counter_metrics: maps.counters.iter().map(|(k, &v)| (k.clone(), v)).collect(),
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        // Serialises savers so the file on disk always ends at the newest state.
        let _guard = self.save_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        write_snapshot(path, &self.snapshot())
    }

    fn restore(&self, path: &Path) -> Result<()> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No snapshot to restore");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_slice(&data)?;
        tracing::info!(
            path = %path.display(),
            gauges = snapshot.gauge_metrics.len(),
            counters = snapshot.counter_metrics.len(),
            "Snapshot restored"
        );
        self.replace(snapshot);
        Ok(())
    }
}

/// Atomically replaces `path` with `snapshot`: the JSON goes to a temporary
/// file in the same directory, is synced, then renamed over the target.
pub(crate) fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let data = serde_json::to_vec_pretty(snapshot)?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    tracing::debug!(path = %path.display(), bytes = data.len(), "Snapshot saved");
    Ok(())
}
