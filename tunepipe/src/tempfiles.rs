//! Scratch files for download mode and their periodic cleanup.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Every file the store creates starts with this prefix; the sweep never
/// touches anything else.
pub const TEMP_PREFIX: &str = "tunepipe-";

/// Directory of request-scoped scratch files.
#[derive(Debug)]
pub struct TempStore {
    dir: PathBuf,
    max_age: Duration,
}

impl TempStore {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Reserve a fresh path. Names are random, so concurrent requests never
    /// share a file.
    pub fn claim(&self, extension: &str) -> TempFile {
        let name = format!(
            "{}{}.{}",
            TEMP_PREFIX,
            uuid::Uuid::new_v4().simple(),
            extension.trim_start_matches('.')
        );
        TempFile {
            path: self.dir.join(name),
            removed: false,
        }
    }

    /// Delete store files whose modification time is older than `max_age`.
    /// Returns the number of files removed.
    pub async fn sweep(&self) -> io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let now = SystemTime::now();
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let owned = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(TEMP_PREFIX));
            if !owned {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age <= self.max_age {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    debug!(path = %path.display(), "Removed stale temp file");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale temp file"),
            }
        }

        if removed > 0 {
            info!(count = removed, "Swept stale temp files");
        }
        Ok(removed)
    }

    /// Run [`TempStore::sweep`] every `interval` until `cancel_token` fires.
    pub fn start_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Temp sweep task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = store.sweep().await {
                            warn!(error = %e, "Temp sweep failed");
                        }
                    }
                }
            }
        })
    }
}

/// A claimed scratch path, removed when dropped.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
    removed: bool,
}

impl TempFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole file and delete it.
    pub async fn read_and_remove(mut self) -> io::Result<Vec<u8>> {
        let data = tokio::fs::read(&self.path).await?;
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            warn!(path = %self.path.display(), error = %e, "Failed to remove temp file");
        }
        self.removed = true;
        Ok(data)
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.removed {
            // Missing is fine: the producer may never have created it.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
