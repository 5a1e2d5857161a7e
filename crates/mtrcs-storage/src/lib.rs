//! Metric storage layer.
//!
//! Three backends implement the same [`Storage`] capability:
//!
//! - [`mem::MemStorage`]: process-local maps behind one read-write lock.
//! - [`sync_mem::SyncMemStorage`]: `MemStorage` that rewrites its snapshot file
//!   after every successful update.
//! - [`sql::SqlStorage`]: PostgreSQL (or SQLite) tables with atomic upserts and
//!   transactional batches.
//!
//! The backend is chosen once at startup and shared as `Arc<dyn Storage>`.

pub mod error;
pub mod mem;
pub mod retry;
pub mod sql;
pub mod sync_mem;


use std::path::Path;

use async_trait::async_trait;
use mtrcs_common::types::{CounterMetric, GaugeMetric, MetricRecord, Snapshot};

pub use error::{Result, StorageError};
pub use mem::MemStorage;
pub use sql::SqlStorage;
pub use sync_mem::SyncMemStorage;

/// Write side of a metric store.
#[async_trait]
pub trait MetricUpdater: Send + Sync {
    /// Overwrites the gauge `name`.
    async fn update_gauge(&self, name: &str, value: f64) -> Result<()>;

    /// Adds `delta` to the counter `name` (missing counters start at 0) and
    /// returns the new total.
    async fn update_counter(&self, name: &str, delta: i64) -> Result<i64>;

    /// Applies every record of the batch, all or nothing.
    ///
    /// Returns the records as stored: gauges echo their value, counters carry
    /// the resulting total in `delta`.
    async fn update_batch(&self, records: &[MetricRecord]) -> Result<Vec<MetricRecord>>;
}

/// Read side of a metric store.
#[async_trait]
pub trait MetricGetter: Send + Sync {
    /// Fails with [`StorageError::NoSuchMetric`] when the gauge was never written.
    async fn get_gauge(&self, name: &str) -> Result<GaugeMetric>;

    /// Fails with [`StorageError::NoSuchMetric`] when the counter was never written.
    async fn get_counter(&self, name: &str) -> Result<CounterMetric>;

    /// All gauges, in no particular order.
    async fn get_all_gauges(&self) -> Result<Vec<GaugeMetric>>;

    /// All counters, in no particular order.
    async fn get_all_counters(&self) -> Result<Vec<CounterMetric>>;
}

/// A complete metric backend.
///
/// Implementations must be safe to share across threads (`Send + Sync`)
/// because the same instance is used by the HTTP handlers, the gRPC service
/// and the background snapshot task.
#[async_trait]
pub trait Storage: MetricUpdater + MetricGetter {
    /// Checks that the backend is reachable.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Backends whose whole state can be dumped to and loaded from a file.
pub trait SnapshotStore: Send + Sync {
    /// Copies the current state under the read lock.
    fn snapshot(&self) -> Snapshot;

    /// Writes the current state to `path`, replacing the file atomically.
    fn save(&self, path: &Path) -> Result<()>;

    /// Replaces the current state with the snapshot at `path`. A missing file
    /// leaves the state untouched.
    fn restore(&self, path: &Path) -> Result<()>;
}
