//! Status cache and change detection.
//!
//! The cache remembers the last run snapshot this site reacted to. It is a
//! debouncer, not a system of record: polling returns every active run on each
//! pass, and only runs whose status moved since the cached snapshot (or that
//! were never seen) are handed on for execution.
//!
//! When the backing store fails, detection fails open: every run of this site
//! is reported as changed. A duplicate dispatch is absorbed by the state
//! machine's idempotency guard; a dropped one could stall a run forever.

mod file;
mod memory;

pub use file::FileSnapshotStore;
pub use memory::MemorySnapshotStore;

use crate::config::{CacheBackend, Config};
use crate::errors::CacheError;
use async_trait::async_trait;
use fedrun_common::{Run, RunStatus};
use std::sync::Arc;
use std::time::Duration;

/// How long a snapshot is remembered.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Key-value storage for serialized run snapshots with per-entry expiry.
///
/// Implementations must be safe for concurrent use on independent keys.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The stored snapshot, or `None` if absent or expired.
    async fn get(&self, run_id: &str) -> Result<Option<String>, CacheError>;

    async fn put(&self, run_id: &str, snapshot: String, ttl: Duration) -> Result<(), CacheError>;

    async fn remove(&self, run_id: &str) -> Result<(), CacheError>;

    /// Drop every snapshot, returning how many were removed.
    async fn clear(&self) -> Result<usize, CacheError>;

    fn backend_name(&self) -> &'static str;
}

/// Build the snapshot store selected in the configuration.
pub fn store_from_config(config: &Config) -> Arc<dyn SnapshotStore> {
    match config.cache_backend {
        CacheBackend::Memory => Arc::new(MemorySnapshotStore::new()),
        CacheBackend::File => Arc::new(FileSnapshotStore::new(config.cache_dir())),
    }
}

/// Turns repeated polls into edge-triggered dispatch.
#[derive(Clone)]
pub struct ChangeDetector {
    store: Arc<dyn SnapshotStore>,
    ttl: Duration,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn SnapshotStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    /// Return the runs of `site_uid` whose status differs from the cached
    /// snapshot, recording each returned run's snapshot before returning it.
    pub async fn check_and_record(&self, remote_runs: &[Run], site_uid: &str) -> Vec<Run> {
        let changed = self.pending(remote_runs, site_uid).await;
        for run in &changed {
            self.record(run).await;
        }
        changed
    }

    /// The runs `check_and_record` would return, without recording anything.
    pub async fn pending(&self, remote_runs: &[Run], site_uid: &str) -> Vec<Run> {
        let mut changed = Vec::new();

        for run in remote_runs.iter().filter(|r| r.site_uid == site_uid) {
            let is_change = match self.cached(&run.id).await {
                Ok(Some(previous)) => previous.status != run.status,
                Ok(None) => true,
                Err(err) => {
                    tracing::warn!(
                        run_id = %run.id,
                        backend = self.store.backend_name(),
                        error = %err,
                        "Status cache unavailable, treating run as changed"
                    );
                    true
                }
            };
            if is_change {
                changed.push(run.clone());
            }
        }

        changed
    }

    /// True when the cached snapshot shows `run` still at `expected`, i.e. the
    /// remote status has not moved since this site last reacted. Never writes.
    ///
    /// An unavailable cache answers `true` so that stuck runs are retried.
    pub async fn is_stable(&self, run: &Run, expected: RunStatus) -> bool {
        if run.status != expected {
            return false;
        }
        match self.cached(&run.id).await {
            Ok(Some(previous)) => previous.status == expected,
            Ok(None) => false,
            Err(err) => {
                tracing::warn!(
                    run_id = %run.id,
                    error = %err,
                    "Status cache unavailable during stability check"
                );
                true
            }
        }
    }

    /// Evict a run so the next poll treats it as changed.
    pub async fn forget(&self, run_id: &str) {
        if let Err(err) = self.store.remove(run_id).await {
            tracing::warn!(run_id, error = %err, "Failed to evict cached snapshot");
        }
    }

    /// Drop every cached snapshot.
    pub async fn reset(&self) -> Result<usize, CacheError> {
        self.store.clear().await
    }

    /// The cached snapshot of a run, decoded.
    pub async fn cached(&self, run_id: &str) -> Result<Option<Run>, CacheError> {
        let Some(raw) = self.store.get(run_id).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| CacheError::Corrupt {
                run_id: run_id.to_string(),
                source,
            })
    }

    async fn record(&self, run: &Run) {
        let snapshot = match serde_json::to_string(run) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(run_id = %run.id, error = %err, "Failed to encode run snapshot");
                return;
            }
        };
        if let Err(err) = self.store.put(&run.id, snapshot, self.ttl).await {
            tracing::warn!(
                run_id = %run.id,
                error = %err,
                "Failed to record run snapshot; the run will be re-dispatched on the next poll"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedrun_common::Role;

    fn run(id: &str, site: &str, status: RunStatus) -> Run {
        Run {
            id: id.to_string(),
            site_uid: site.to_string(),
            role: Role::Participant,
            status,
            ..Default::default()
        }
    }

    fn detector() -> ChangeDetector {
        ChangeDetector::new(Arc::new(MemorySnapshotStore::new()), DEFAULT_TTL)
    }

    struct DownStore;

    #[async_trait]
    impl SnapshotStore for DownStore {
        async fn get(&self, _run_id: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }

        async fn put(&self, _: &str, _: String, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }

        async fn remove(&self, _run_id: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }

        async fn clear(&self) -> Result<usize, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }

        fn backend_name(&self) -> &'static str {
            "down"
        }
    }

    #[tokio::test]
    async fn test_first_sighting_is_a_change() {
        let detector = detector();
        let runs = vec![run("1", "site-a", RunStatus::Standby)];
        let changed = detector.check_and_record(&runs, "site-a").await;
        assert_eq!(changed.len(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_repoll_yields_nothing() {
        let detector = detector();
        let runs = vec![run("1", "site-a", RunStatus::Standby)];
        detector.check_and_record(&runs, "site-a").await;
        assert!(detector.check_and_record(&runs, "site-a").await.is_empty());
    }

    #[tokio::test]
    async fn test_status_change_yields_exactly_one() {
        let detector = detector();
        detector
            .check_and_record(&[run("1", "site-a", RunStatus::Standby)], "site-a")
            .await;

        let moved = vec![run("1", "site-a", RunStatus::Preparing)];
        let changed = detector.check_and_record(&moved, "site-a").await;
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, RunStatus::Preparing);
        assert!(detector.check_and_record(&moved, "site-a").await.is_empty());
    }

    #[tokio::test]
    async fn test_other_sites_are_ignored() {
        let detector = detector();
        let runs = vec![
            run("1", "site-a", RunStatus::Standby),
            run("2", "site-b", RunStatus::Standby),
        ];
        let changed = detector.check_and_record(&runs, "site-a").await;
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, "1");
        assert!(detector.cached("2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_does_not_record() {
        let detector = detector();
        let remote = vec![run("1", "site-a", RunStatus::Standby)];

        assert_eq!(detector.pending(&remote, "site-a").await.len(), 1);
        assert_eq!(detector.pending(&remote, "site-a").await.len(), 1);
        assert!(detector.cached("1").await.unwrap().is_none());

        assert_eq!(detector.check_and_record(&remote, "site-a").await.len(), 1);
        assert!(detector.pending(&remote, "site-a").await.is_empty());
    }

    #[tokio::test]
    async fn test_forget_forces_redispatch() {
        let detector = detector();
        let runs = vec![run("1", "site-a", RunStatus::Running)];
        detector.check_and_record(&runs, "site-a").await;
        detector.forget("1").await;
        assert_eq!(detector.check_and_record(&runs, "site-a").await.len(), 1);
    }

    #[tokio::test]
    async fn test_is_stable_does_not_write() {
        let detector = detector();
        let r = run("1", "site-a", RunStatus::Preparing);
        assert!(!detector.is_stable(&r, RunStatus::Preparing).await);
        assert!(detector.cached("1").await.unwrap().is_none());

        detector.check_and_record(std::slice::from_ref(&r), "site-a").await;
        assert!(detector.is_stable(&r, RunStatus::Preparing).await);
        assert!(!detector.is_stable(&r, RunStatus::Aggregating).await);

        let moved = run("1", "site-a", RunStatus::Running);
        assert!(!detector.is_stable(&moved, RunStatus::Running).await);
    }

    #[tokio::test]
    async fn test_unavailable_cache_fails_open() {
        let detector = ChangeDetector::new(Arc::new(DownStore), DEFAULT_TTL);
        let runs = vec![run("1", "site-a", RunStatus::Standby)];
        assert_eq!(detector.check_and_record(&runs, "site-a").await.len(), 1);
        assert_eq!(detector.check_and_record(&runs, "site-a").await.len(), 1);
        assert!(detector.is_stable(&runs[0], RunStatus::Standby).await);
        detector.forget("1").await;
        assert!(detector.reset().await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_counts_as_change() {
        let store = Arc::new(MemorySnapshotStore::new());
        store
            .put("1", "not json".to_string(), DEFAULT_TTL)
            .await
            .unwrap();
        let detector = ChangeDetector::new(store, DEFAULT_TTL);
        let runs = vec![run("1", "site-a", RunStatus::Standby)];
        assert_eq!(detector.check_and_record(&runs, "site-a").await.len(), 1);
        assert!(detector.check_and_record(&runs, "site-a").await.is_empty());
    }

    #[tokio::test]
    async fn test_reset_clears_all() {
        let detector = detector();
        let runs = vec![
            run("1", "site-a", RunStatus::Standby),
            run("2", "site-a", RunStatus::Running),
        ];
        detector.check_and_record(&runs, "site-a").await;
        assert_eq!(detector.reset().await.unwrap(), 2);
        assert_eq!(detector.check_and_record(&runs, "site-a").await.len(), 2);
    }
}
