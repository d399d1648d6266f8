use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_core::error::AppError;
use keel_core::traits::KvStore;
use keel_core::util::compute_hash;
use serde::{Deserialize, Serialize};

/// On-disk record for one key.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    key: String,
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Envelope {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }
}

/// Local-directory [`KvStore`], one JSON file per key.
///
/// File names are the SHA-256 of the key. Writes go to a temporary file in
/// the same directory and are renamed into place, so readers never observe
/// a half-written record.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    tmp_seq: Arc<AtomicU64>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, AppError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create directory", &dir, e))?;
        Ok(Self {
            dir,
            tmp_seq: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Remove every expired record. Returns how many were deleted.
    pub async fn purge_expired(&self) -> Result<usize, AppError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_error("list", &self.dir, e))?;

        let now = Utc::now();
        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list", &self.dir, e))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match read_envelope(&path).await {
                Ok(Some(envelope)) if envelope.is_expired(now) => {
                    remove_quietly(&path).await;
                    removed += 1;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }

        if removed > 0 {
            tracing::info!(removed, dir = %self.dir.display(), "Purged expired records");
        }
        Ok(removed)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", compute_hash(key)))
    }

    fn tmp_path_for(&self, key: &str) -> PathBuf {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!(
            ".{}.{}-{seq}.tmp",
            compute_hash(key),
            std::process::id()
        ))
    }
}

impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let path = self.path_for(key);
        let Some(envelope) = read_envelope(&path).await? else {
            return Ok(None);
        };

        if envelope.key != key {
            return Ok(None);
        }
        if envelope.is_expired(Utc::now()) {
            remove_quietly(&path).await;
            return Ok(None);
        }
        Ok(Some(envelope.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError> {
        let expires_at = match ttl {
            Some(ttl) => Some(
                Utc::now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| AppError::StoreError(format!("Invalid TTL: {e}")))?,
            ),
            None => None,
        };
        let envelope = Envelope {
            key: key.to_string(),
            value: value.to_string(),
            expires_at,
        };
        let bytes = serde_json::to_vec(&envelope)?;

        let tmp = self.tmp_path_for(key);
        let path = self.path_for(key);
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            return Err(io_error("write", &tmp, e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            remove_quietly(&tmp).await;
            return Err(io_error("rename", &path, e));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete", &path, e)),
        }
    }
}

async fn read_envelope(path: &Path) -> Result<Option<Envelope>, AppError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error("read", path, e)),
    };
    let envelope = serde_json::from_slice(&bytes).map_err(|e| {
        AppError::StoreError(format!("Corrupt record {}: {e}", path.display()))
    })?;
    Ok(Some(envelope))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != ErrorKind::NotFound
    {
        tracing::debug!(path = %path.display(), error = %e, "Could not remove file");
    }
}

fn io_error(op: &str, path: &Path, e: std::io::Error) -> AppError {
    AppError::StoreError(format!("Failed to {op} {}: {e}", path.display()))
}
