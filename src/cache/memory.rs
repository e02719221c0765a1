use super::SnapshotStore;
use crate::errors::CacheError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    snapshot: String,
    expires_at: Instant,
}

/// In-process snapshot store. Expired entries are dropped lazily on read.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: DashMap<String, Entry>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get(&self, run_id: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let expired = match self.entries.get(run_id) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.snapshot.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(run_id, |_, entry| entry.expires_at <= now);
        }
        Ok(None)
    }

    async fn put(&self, run_id: &str, snapshot: String, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(
            run_id.to_string(),
            Entry {
                snapshot,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn remove(&self, run_id: &str) -> Result<(), CacheError> {
        self.entries.remove(run_id);
        Ok(())
    }

    async fn clear(&self) -> Result<usize, CacheError> {
        let count = self.entries.len();
        self.entries.clear();
        Ok(count)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get() {
        let store = MemorySnapshotStore::new();
        store
            .put("1", "{}".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("1").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent() {
        let store = MemorySnapshotStore::new();
        store
            .put("1", "{}".to_string(), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("1").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_single_entry() {
        let store = MemorySnapshotStore::new();
        let ttl = Duration::from_secs(60);
        store.put("1", "a".to_string(), ttl).await.unwrap();
        store.put("1", "b".to_string(), ttl).await.unwrap();
        assert_eq!(store.get("1").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_independent_keys() {
        let store = std::sync::Arc::new(MemorySnapshotStore::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .put(&i.to_string(), format!("{i}"), Duration::from_secs(60))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.len(), 32);
        assert_eq!(store.get("7").await.unwrap().as_deref(), Some("7"));
    }
}
