use super::SnapshotStore;
use crate::errors::CacheError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// On-disk record; expiry is computed from `stored_at + ttl_secs` at read time.
#[derive(Debug, Serialize, Deserialize)]
struct StoredSnapshot {
    stored_at: DateTime<Utc>,
    ttl_secs: u64,
    snapshot: String,
}

impl StoredSnapshot {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::seconds(self.ttl_secs.min(i64::MAX as u64) as i64);
        self.stored_at + ttl <= now
    }
}

/// Snapshot store keeping one JSON document per run in a directory, so that
/// change detection survives a worker restart.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `run-{id}.json`, with every byte outside `[A-Za-z0-9-]` written as
    /// `%XX` so that distinct ids never share a file.
    fn entry_path(&self, run_id: &str) -> PathBuf {
        let mut name = String::with_capacity(run_id.len());
        for c in run_id.chars() {
            if c.is_ascii_alphanumeric() || c == '-' {
                name.push(c);
            } else {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    name.push('%');
                    name.push_str(&hex::encode_upper([byte]));
                }
            }
        }
        self.dir.join(format!("run-{}.json", name))
    }

    fn io_error(path: &Path, source: std::io::Error) -> CacheError {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn get(&self, run_id: &str) -> Result<Option<String>, CacheError> {
        let path = self.entry_path(run_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Self::io_error(&path, err)),
        };
        let stored: StoredSnapshot =
            serde_json::from_str(&raw).map_err(|source| CacheError::Corrupt {
                run_id: run_id.to_string(),
                source,
            })?;
        if stored.is_expired(Utc::now()) {
            tokio::fs::remove_file(&path).await.ok();
            return Ok(None);
        }
        Ok(Some(stored.snapshot))
    }

    async fn put(&self, run_id: &str, snapshot: String, ttl: Duration) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| Self::io_error(&self.dir, err))?;

        let stored = StoredSnapshot {
            stored_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
            snapshot,
        };
        let encoded = serde_json::to_string(&stored).map_err(|source| CacheError::Corrupt {
            run_id: run_id.to_string(),
            source,
        })?;

        // Write-then-rename so a concurrent reader never sees a partial file.
        let path = self.entry_path(run_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, encoded)
            .await
            .map_err(|err| Self::io_error(&tmp, err))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|err| Self::io_error(&path, err))
    }

    async fn remove(&self, run_id: &str) -> Result<(), CacheError> {
        let path = self.entry_path(run_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_error(&path, err)),
        }
    }

    async fn clear(&self) -> Result<usize, CacheError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(Self::io_error(&self.dir, err)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| Self::io_error(&self.dir, err))?
        {
            let path = entry.path();
            let is_snapshot = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("run-") && n.ends_with(".json"));
            if is_snapshot {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|err| Self::io_error(&path, err))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}
