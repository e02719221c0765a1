use super::{Dispatch, Trigger};
use crate::cache::ChangeDetector;
use crate::errors::RouterError;
use crate::observability::detect_span;
use crate::router::RouterClient;
use std::sync::Arc;
use tracing::Instrument;

/// Finds the runs of one site that need a step.
#[derive(Clone)]
pub struct Detector {
    site_uid: String,
    router: Arc<dyn RouterClient>,
    cache: ChangeDetector,
}

impl Detector {
    pub fn new(
        site_uid: impl Into<String>,
        router: Arc<dyn RouterClient>,
        cache: ChangeDetector,
    ) -> Self {
        Self {
            site_uid: site_uid.into(),
            router,
            cache,
        }
    }

    /// Poll pass: one dispatch per run of this site whose status moved since
    /// the last pass (or that was never seen).
    pub async fn detect_changes(&self) -> Result<Vec<Dispatch>, RouterError> {
        async {
            let remote = self.router.fetch_active_runs().await?;
            let changed = self.cache.check_and_record(&remote, &self.site_uid).await;
            tracing::debug!(active = remote.len(), changed = changed.len(), "Poll pass");
            Ok::<Vec<Dispatch>, RouterError>(
                changed
                    .into_iter()
                    .map(|run| Dispatch::new(run, Trigger::Poll))
                    .collect(),
            )
        }
        .instrument(detect_span("poll", &self.site_uid))
        .await
    }

    /// The dispatches a poll pass would produce, leaving the cache untouched
    /// so a running worker still sees every change.
    pub async fn preview_changes(&self) -> Result<Vec<Dispatch>, RouterError> {
        async {
            let remote = self.router.fetch_active_runs().await?;
            let pending = self.cache.pending(&remote, &self.site_uid).await;
            Ok::<Vec<Dispatch>, RouterError>(
                pending
                    .into_iter()
                    .map(|run| Dispatch::new(run, Trigger::Poll))
                    .collect(),
            )
        }
        .instrument(detect_span("preview", &self.site_uid))
        .await
    }

    /// Monitor pass: coordinator runs of this site sitting in a waiting state
    /// whose remote status still equals the cached one. Their poll dispatch
    /// ended in a wait and no status change will trigger another.
    pub async fn detect_stalled(&self) -> Result<Vec<Dispatch>, RouterError> {
        async {
            let remote = self.router.fetch_active_runs().await?;
            let mut stalled = Vec::new();
            for run in remote.into_iter().filter(|r| {
                r.site_uid == self.site_uid && r.is_coordinator() && r.status.is_coordinator_wait()
            }) {
                if self.cache.is_stable(&run, run.status).await {
                    stalled.push(Dispatch::new(run, Trigger::Monitor));
                }
            }
            if !stalled.is_empty() {
                tracing::info!(stalled = stalled.len(), "Re-enqueueing waiting coordinator runs");
            }
            Ok::<Vec<Dispatch>, RouterError>(stalled)
        }
        .instrument(detect_span("monitor", &self.site_uid))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DEFAULT_TTL, MemorySnapshotStore};
    use crate::router::InMemoryRouter;
    use fedrun_common::{Role, Run, RunStatus};

    fn run(id: &str, site: &str, role: Role, status: RunStatus) -> Run {
        Run {
            id: id.to_string(),
            site_uid: site.to_string(),
            role,
            status,
            ..Default::default()
        }
    }

    fn detector(router: Arc<InMemoryRouter>) -> Detector {
        let cache = ChangeDetector::new(Arc::new(MemorySnapshotStore::new()), DEFAULT_TTL);
        Detector::new("site-a", router, cache)
    }

    #[tokio::test]
    async fn test_poll_enqueues_only_changes() {
        let router = Arc::new(InMemoryRouter::with_runs([
            run("1", "site-a", Role::Participant, RunStatus::Standby),
            run("2", "site-b", Role::Participant, RunStatus::Standby),
        ]));
        let detector = detector(router.clone());

        let first = detector.detect_changes().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].trigger, Trigger::Poll);
        assert!(detector.detect_changes().await.unwrap().is_empty());

        router.set_status("1", RunStatus::Preparing);
        let moved = detector.detect_changes().await.unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].run.status, RunStatus::Preparing);
    }

    #[tokio::test]
    async fn test_preview_leaves_changes_for_the_poll() {
        let router = Arc::new(InMemoryRouter::with_runs([run(
            "1",
            "site-a",
            Role::Participant,
            RunStatus::Standby,
        )]));
        let detector = detector(router);

        assert_eq!(detector.preview_changes().await.unwrap().len(), 1);
        assert_eq!(detector.preview_changes().await.unwrap().len(), 1);
        assert_eq!(detector.detect_changes().await.unwrap().len(), 1);
        assert!(detector.preview_changes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_monitor_picks_stable_waiting_coordinators() {
        let router = Arc::new(InMemoryRouter::with_runs([
            run("1", "site-a", Role::Coordinator, RunStatus::Preparing),
            run("2", "site-a", Role::Participant, RunStatus::Preparing),
            run("3", "site-a", Role::Coordinator, RunStatus::Running),
        ]));
        let detector = detector(router.clone());

        // Nothing is cached yet, so nothing is stable.
        assert!(detector.detect_stalled().await.unwrap().is_empty());

        detector.detect_changes().await.unwrap();
        let stalled = detector.detect_stalled().await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].run.id, "1");
        assert_eq!(stalled[0].trigger, Trigger::Monitor);

        // A remote move not yet seen by a poll is not stale.
        router.set_status("1", RunStatus::Running);
        assert!(detector.detect_stalled().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_router_failure_surfaces() {
        let router = Arc::new(InMemoryRouter::new());
        router.set_offline(true);
        let detector = detector(router);
        assert!(detector.detect_changes().await.is_err());
        assert!(detector.detect_stalled().await.is_err());
    }
}
