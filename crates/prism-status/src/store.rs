use crate::snapshot::StatusSnapshot;
use async_trait::async_trait;
use parking_lot::Mutex;
use prism_core::{PrismError, PrismResult};
use std::path::{Path, PathBuf};

/// Durable storage for the latest status snapshot.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &StatusSnapshot) -> PrismResult<()>;

    /// `Ok(None)` when nothing was ever saved.
    async fn load(&self) -> PrismResult<Option<StatusSnapshot>>;
}

/// Stores the snapshot as one pretty-printed JSON file.
///
/// Writes go to a sibling temporary file that is then renamed over the
/// target, so a crash mid-write never leaves a truncated snapshot behind.
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_else(|| "status.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: &StatusSnapshot) -> PrismResult<()> {
        let persist_err =
            |e: std::io::Error| PrismError::Persistence(format!("{}: {e}", self.path.display()));

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(persist_err)?;
            }
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, json).await.map_err(persist_err)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(persist_err)?;
        Ok(())
    }

    async fn load(&self) -> PrismResult<Option<StatusSnapshot>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PrismError::SnapshotLoad(format!(
                    "{}: {e}",
                    self.path.display()
                )))
            }
        };
        let snapshot = serde_json::from_str(&data).map_err(|e| {
            PrismError::SnapshotLoad(format!("Failed to parse {}: {e}", self.path.display()))
        })?;
        Ok(Some(snapshot))
    }
}

/// Keeps the last snapshot in memory. Used when persistence is disabled.
#[derive(Default)]
pub struct MemorySnapshotStore {
    slot: Mutex<Option<StatusSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &StatusSnapshot) -> PrismResult<()> {
        *self.slot.lock() = Some(snapshot.clone());
        Ok(())
    }

    async fn load(&self) -> PrismResult<Option<StatusSnapshot>> {
        Ok(self.slot.lock().clone())
    }
}
