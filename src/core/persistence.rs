//! Snapshot persistence for the job registry and correlation index.
//!
//! State is stored as one versioned JSON document under a single key.
//! Unreadable or incompatible documents are logged and treated as empty;
//! they never stop the daemon from starting.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::models::JobId;
use super::state::{PERSISTED_STATE_VERSION, PersistedState};
use super::tracker::{JobTracker, TrackerEvent};

pub const STORE_KEY: &str = "runwatch.jobs";

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Key/value storage for serialized snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>, PersistError>;
    async fn save(&self, key: &str, value: &str) -> Result<(), PersistError>;
}

/// Stores each key as `<dir>/<key>.json`, written via a temp file and rename.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl SnapshotStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<String>, PersistError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), PersistError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<String>, PersistError> {
        Ok(self
            .entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).cloned()))
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), PersistError> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub restored: usize,
    pub resumed: Vec<JobId>,
}

pub struct PersistenceGateway {
    store: Box<dyn SnapshotStore>,
    key: String,
}

impl PersistenceGateway {
    pub fn new(store: Box<dyn SnapshotStore>) -> Self {
        Self {
            store,
            key: STORE_KEY.to_string(),
        }
    }

    /// Sweep dismissed jobs, then write the current state.
    pub async fn snapshot(&self, tracker: &JobTracker) -> Result<usize, PersistError> {
        let persisted = {
            let mut state = tracker.state().write().await;
            let swept = state.sweep_dismissed();
            if !swept.is_empty() {
                debug!(count = swept.len(), "Swept dismissed jobs");
            }
            state.to_persisted()
        };
        let count = persisted.jobs.len();
        let encoded = serde_json::to_string(&persisted)?;
        self.store.save(&self.key, &encoded).await?;
        debug!(jobs = count, "State snapshot saved");
        Ok(count)
    }

    /// Merge the stored snapshot into the tracker and resume polling for
    /// unfinished jobs. Restoring twice is a no-op the second time.
    pub async fn restore(&self, tracker: &JobTracker) -> RestoreOutcome {
        let raw = match self.store.load(&self.key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return RestoreOutcome::default(),
            Err(e) => {
                warn!(error = %e, "Could not read saved state; starting empty");
                return RestoreOutcome::default();
            }
        };

        let persisted: PersistedState = match serde_json::from_str(&raw) {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(error = %e, "Saved state is unreadable; starting empty");
                return RestoreOutcome::default();
            }
        };
        if persisted.version != PERSISTED_STATE_VERSION {
            warn!(
                found = persisted.version,
                expected = PERSISTED_STATE_VERSION,
                "Saved state has an unknown version; starting empty"
            );
            return RestoreOutcome::default();
        }

        let (restored, resumed) = {
            let mut state = tracker.state().write().await;
            let before = state.registry.len();
            let resumed = state.merge_persisted(persisted);
            (state.registry.len() - before, resumed)
        };
        tracker.resume(&resumed).await;
        info!(restored, resumed = resumed.len(), "Saved state restored");
        RestoreOutcome { restored, resumed }
    }

    /// Snapshot periodically and after every terminal transition, until
    /// `shutdown` fires. A final snapshot is written on the way out.
    pub async fn run(&self, tracker: JobTracker, interval: Duration, shutdown: CancellationToken) {
        let mut events = tracker.subscribe();
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                event = events.recv() => match event {
                    Ok(TrackerEvent::JobFinished { .. } | TrackerEvent::Cleared) => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Snapshot loop lagged behind tracker events");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
            if let Err(e) = self.snapshot(&tracker).await {
                warn!(error = %e, "Failed to save state snapshot");
            }
        }

        if let Err(e) = self.snapshot(&tracker).await {
            warn!(error = %e, "Failed to save final state snapshot");
        }
    }
}
