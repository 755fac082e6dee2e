use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{FarmError, Result};
use crate::scheduler::job::Job;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct QueueSnapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    jobs: Vec<Job>,
}

/// Durable copy of a local queue. Every save replaces the file atomically
/// (write a temp file, fsync, rename), so a crash leaves either the old or
/// the new snapshot on disk, never a torn one.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, jobs: &[Job]) -> Result<()> {
        write_queue_file(&self.path, jobs).await
    }

    /// Read the last snapshot. A missing file is an empty queue; an
    /// unreadable one is moved aside and reported as `StateCorruption`.
    pub async fn load(&self) -> Result<Vec<Job>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<QueueSnapshot>(&bytes) {
            Ok(snapshot) => Ok(snapshot.jobs),
            Err(e) => {
                let preserved_at = self.preserve_corrupt().await?;
                Err(FarmError::StateCorruption {
                    path: self.path.clone(),
                    preserved_at,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn preserve_corrupt(&self) -> Result<PathBuf> {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%d%H%M%S%3f")));
        let preserved = PathBuf::from(name);
        tokio::fs::rename(&self.path, &preserved).await?;
        Ok(preserved)
    }
}

/// Write a queue file atomically. Also used for queue export.
pub async fn write_queue_file(path: &Path, jobs: &[Job]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let snapshot = QueueSnapshot {
        version: SNAPSHOT_VERSION,
        saved_at: Utc::now(),
        jobs: jobs.to_vec(),
    };
    let bytes = serde_json::to_vec_pretty(&snapshot)?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Read a queue file written by [`write_queue_file`].
pub async fn read_queue_file(path: &Path) -> Result<Vec<Job>> {
    let bytes = tokio::fs::read(path).await?;
    let snapshot: QueueSnapshot = serde_json::from_slice(&bytes)?;
    Ok(snapshot.jobs)
}
