use std::{
    fs::{File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use bubbler_common::{PersistedSnapshot, RuntimeConfig};
use serde::Serialize;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// JSON files under the data directory.
#[derive(Clone)]
pub struct AppStore {
    runtime_path: Arc<PathBuf>,
    snapshot_path: Arc<PathBuf>,
    log_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AppStore {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("BUBBLER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.bubbler"));
        Self::in_dir(data_dir)
    }

    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            snapshot_path: Arc::new(data_dir.join("state.json")),
            log_path: Arc::new(data_dir.join("debug.log")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn runtime_path(&self) -> &Path {
        &self.runtime_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Opens `debug.log` for appending. Called before the async runtime does
    /// any logging, so it stays on std I/O.
    pub fn open_log_file(&self) -> std::io::Result<File> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path.as_ref())
    }

    /// `Ok(None)` when no runtime config has been written yet.
    pub async fn load_runtime_config(&self) -> anyhow::Result<Option<RuntimeConfig>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(Some(serde_json::from_slice::<RuntimeConfig>(&raw).with_context(
                || format!("malformed {}", self.runtime_path.display()),
            )?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        write_json(&self.runtime_path, runtime).await
    }

    /// Missing or malformed files yield the default snapshot; any other I/O
    /// error is returned.
    pub async fn load_snapshot(&self) -> anyhow::Result<PersistedSnapshot> {
        let _guard = self.lock.lock().await;
        let raw = match tokio::fs::read(self.snapshot_path.as_ref()).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(PersistedSnapshot::default())
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.snapshot_path.display()))
            }
        };

        match serde_json::from_slice::<PersistedSnapshot>(&raw) {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                warn!(
                    "ignoring malformed {}: {err}",
                    self.snapshot_path.display()
                );
                Ok(PersistedSnapshot::default())
            }
        }
    }

    pub async fn save_snapshot(&self, snapshot: &PersistedSnapshot) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        write_json(&self.snapshot_path, snapshot).await
    }
}

// Write-then-rename so a power cut never leaves a truncated file.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let payload = serde_json::to_vec_pretty(value)?;
    let staging = path.with_extension("json.tmp");
    tokio::fs::write(&staging, payload).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

/// Single writer for snapshots. Bursts are coalesced to the newest one.
pub fn spawn_snapshot_writer(
    store: AppStore,
    mut snapshots: mpsc::UnboundedReceiver<PersistedSnapshot>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(mut snapshot) = snapshots.recv().await {
            while let Ok(newer) = snapshots.try_recv() {
                snapshot = newer;
            }
            match store.save_snapshot(&snapshot).await {
                Ok(()) => debug!(?snapshot, "snapshot written"),
                Err(err) => warn!("failed to write snapshot: {err:#}"),
            }
        }
    })
}
