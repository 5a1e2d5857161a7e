//! Storage backend selection.
//!
//! The server picks exactly one backend at startup:
//!
//! | setting | backend |
//! |---|---|
//! | `database_dsn` set | [`SqlStorage`] |
//! | `store_interval_secs == 0` | [`SyncMemStorage`] |
//! | otherwise | [`MemStorage`] plus a periodic snapshot task |
//!
//! Everything past this module only sees `Arc<dyn Storage>`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mtrcs_storage::{MemStorage, SnapshotStore, SqlStorage, Storage, SyncMemStorage};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::ServerConfig;

pub enum Backend {
    Sql(Arc<SqlStorage>),
    SyncFile(Arc<SyncMemStorage>),
    Memory {
        storage: Arc<MemStorage>,
        path: PathBuf,
        interval: Duration,
    },
}

impl Backend {
    /// Opens the configured backend and restores the snapshot when asked to.
    pub async fn open(config: &ServerConfig) -> anyhow::Result<Self> {
        if let Some(dsn) = &config.database_dsn {
            let storage = SqlStorage::connect(dsn).await?;
            return Ok(Backend::Sql(Arc::new(storage)));
        }

        let path = config.file_storage_path.clone();
        let backend = if config.store_interval_secs == 0 {
            Backend::SyncFile(Arc::new(SyncMemStorage::new(path)))
        } else {
            Backend::Memory {
                storage: Arc::new(MemStorage::new()),
                path,
                interval: config.store_interval(),
            }
        };
        if config.restore {
            if let Some((store, path)) = backend.snapshot_target() {
                store.restore(&path)?;
            }
        }
        Ok(backend)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Sql(_) => "sql",
            Backend::SyncFile(_) => "sync-file",
            Backend::Memory { .. } => "memory",
        }
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        let storage: Arc<dyn Storage> = match self {
            Backend::Sql(s) => s.clone(),
            Backend::SyncFile(s) => s.clone(),
            Backend::Memory { storage, .. } => storage.clone(),
        };
        storage
    }

    fn snapshot_target(&self) -> Option<(Arc<dyn SnapshotStore>, PathBuf)> {
        let (store, path): (Arc<dyn SnapshotStore>, PathBuf) = match self {
            Backend::Sql(_) => return None,
            Backend::SyncFile(s) => (s.clone(), s.path().to_path_buf()),
            Backend::Memory { storage, path, .. } => (storage.clone(), path.clone()),
        };
        Some((store, path))
    }

    /// Spawns the periodic snapshot task for the in-memory backend.
    pub fn spawn_snapshotter(&self) -> Option<JoinHandle<()>> {
        let Backend::Memory {
            storage,
            path,
            interval: period,
        } = self
        else {
            return None;
        };
        let storage = storage.clone();
        let path = path.clone();
        let period = *period;
        Some(tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick fires immediately
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(e) = save_blocking(storage.clone(), path.clone()).await {
                    tracing::error!(path = %path.display(), error = %e, "Periodic snapshot failed");
                }
            }
        }))
    }

    /// Writes the last snapshot on shutdown. A no-op for the SQL backend.
    pub async fn final_save(&self) -> anyhow::Result<()> {
        if let Some((store, path)) = self.snapshot_target() {
            save_blocking(store, path.clone()).await?;
            tracing::info!(path = %path.display(), "Final snapshot saved");
        }
        Ok(())
    }
}

async fn save_blocking(store: Arc<dyn SnapshotStore>, path: PathBuf) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || store.save(&path)).await??;
    Ok(())
}
