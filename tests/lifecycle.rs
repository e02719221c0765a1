//! Multi-site lifecycle scenarios against the in-process router.

use anyhow::Result;
use async_trait::async_trait;
use fedrun::Site;
use fedrun::config::{CacheBackend, Config};
use fedrun::dispatch::execute;
use fedrun::machine::StepOutcome;
use fedrun::router::InMemoryRouter;
use fedrun::simulate::{SimulationOptions, run_simulation};
use fedrun::task::{Echo, FlTask, TaskContext, TaskRegistry};
use fedrun_common::{Role, Run, RunStatus, TaskStep};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

const MODEL: &str = "Model";

/// Echo for every hook except `training`, which reports failure.
struct FailTraining(Echo);

#[async_trait]
impl FlTask for FailTraining {
    async fn validate(&mut self) -> Result<bool> {
        self.0.validate().await
    }
    async fn training(&mut self) -> Result<bool> {
        Ok(false)
    }
    async fn download_artifacts(&mut self) -> Result<bool> {
        self.0.download_artifacts().await
    }
    async fn do_aggregate(&mut self) -> Result<bool> {
        self.0.do_aggregate().await
    }
}

/// Echo that counts `training` calls.
struct CountTraining {
    inner: Echo,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl FlTask for CountTraining {
    async fn validate(&mut self) -> Result<bool> {
        self.inner.validate().await
    }
    async fn training(&mut self) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.training().await
    }
    async fn download_artifacts(&mut self) -> Result<bool> {
        self.inner.download_artifacts().await
    }
    async fn do_aggregate(&mut self) -> Result<bool> {
        self.inner.do_aggregate().await
    }
}

fn echo_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register(MODEL, |ctx: TaskContext| Box::new(Echo::new(ctx)));
    registry
}

fn failing_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register(MODEL, |ctx: TaskContext| Box::new(FailTraining(Echo::new(ctx))));
    registry
}

fn run(id: &str, site: &str, role: Role, status: RunStatus) -> Run {
    Run {
        id: id.to_string(),
        project_id: "10".to_string(),
        batch_id: "20".to_string(),
        site_uid: site.to_string(),
        role,
        status,
        tasks: vec![TaskStep::new(MODEL)],
        cur_seq: 1,
        ..Default::default()
    }
}

struct Batch {
    router: Arc<InMemoryRouter>,
    coordinator: Site,
    participant: Site,
    _dir: TempDir,
}

impl Batch {
    fn new(participant_registry: TaskRegistry) -> Self {
        Self::with_steps(participant_registry, 1)
    }

    /// A batch whose runs carry `steps` single-round task steps.
    fn with_steps(participant_registry: TaskRegistry, steps: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let runs = [
            run("1", "site-c", Role::Coordinator, RunStatus::Standby),
            run("2", "site-p", Role::Participant, RunStatus::Standby),
        ]
        .map(|mut run| {
            run.tasks = vec![TaskStep::new(MODEL); steps];
            run
        });
        let router = Arc::new(InMemoryRouter::with_runs(runs));
        let coordinator = Site::with_router(
            Config::local("site-c", &dir.path().join("site-c")),
            router.clone(),
            echo_registry(),
        );
        let participant = Site::with_router(
            Config::local("site-p", &dir.path().join("site-p")),
            router.clone(),
            participant_registry,
        );
        Self {
            router,
            coordinator,
            participant,
            _dir: dir,
        }
    }

    fn status(&self, run_id: &str) -> RunStatus {
        self.router.run(run_id).unwrap().status
    }

    async fn drive(&self, max_ticks: usize) -> usize {
        for tick in 1..=max_ticks {
            for site in [&self.coordinator, &self.participant] {
                site.tick().await.unwrap();
                site.monitor_tick().await.unwrap();
            }
            if self.router.runs().iter().all(|r| r.status.is_terminal()) {
                return tick;
            }
        }
        max_ticks
    }

    /// Statuses pushed for `run_id`, in order.
    fn pushed(&self, run_id: &str) -> Vec<RunStatus> {
        self.router
            .transitions()
            .into_iter()
            .filter(|(id, _)| id == run_id)
            .map(|(_, t)| t.to)
            .collect()
    }
}

#[tokio::test]
async fn test_single_round_batch_reaches_success() {
    let batch = Batch::new(echo_registry());
    let ticks = batch.drive(20).await;
    assert!(ticks < 20);

    assert_eq!(batch.status("1"), RunStatus::Success);
    assert_eq!(batch.status("2"), RunStatus::Success);
    assert_eq!(
        batch.pushed("1"),
        vec![
            RunStatus::Preparing,
            RunStatus::Running,
            RunStatus::PendingSuccess,
            RunStatus::PendingAggregating,
            RunStatus::Aggregating,
            RunStatus::Success,
        ]
    );
    assert_eq!(
        batch.pushed("2"),
        vec![
            RunStatus::Preparing,
            RunStatus::PendingSuccess,
            RunStatus::PendingAggregating,
        ]
    );
    assert_eq!(batch.router.uploads().len(), 2);
}

#[tokio::test]
async fn test_two_step_batch_runs_both_steps() {
    let batch = Batch::with_steps(echo_registry(), 2);
    let ticks = batch.drive(40).await;
    assert!(ticks < 40);

    for id in ["1", "2"] {
        let run = batch.router.run(id).unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.cur_seq, 2);
    }
    let coordinator = batch.pushed("1");
    assert_eq!(
        coordinator.iter().filter(|s| **s == RunStatus::Standby).count(),
        1
    );
    assert_eq!(
        coordinator.iter().filter(|s| **s == RunStatus::Aggregating).count(),
        2
    );
    assert_eq!(batch.router.uploads().len(), 4);
}

#[tokio::test]
async fn test_participant_training_failure_fails_batch() {
    let batch = Batch::new(failing_registry());
    batch.drive(20).await;

    assert_eq!(
        batch.pushed("2"),
        vec![RunStatus::Preparing, RunStatus::PendingFailed, RunStatus::Failed]
    );
    assert_eq!(batch.status("2"), RunStatus::Failed);
    assert_eq!(batch.status("1"), RunStatus::Failed);
    assert_eq!(batch.pushed("1").last(), Some(&RunStatus::Failed));
    assert!(!batch.pushed("1").contains(&RunStatus::Aggregating));
}

#[tokio::test]
async fn test_monitor_unblocks_waiting_coordinator() {
    let batch = Batch::new(echo_registry());

    // Coordinator validates and then waits for the participant.
    batch.coordinator.tick().await.unwrap();
    let waiting = batch.coordinator.tick().await.unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].outcome, StepOutcome::Waiting);

    batch.participant.tick().await.unwrap();
    assert_eq!(batch.status("2"), RunStatus::Preparing);

    // No status change on the coordinator's run, so polling alone stalls.
    assert!(batch.coordinator.tick().await.unwrap().is_empty());

    let reports = batch.coordinator.monitor_tick().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, StepOutcome::Transitioned(RunStatus::Running));
    assert_eq!(batch.status("2"), RunStatus::Running);
}

#[tokio::test]
async fn test_redispatch_of_settled_step_is_noop() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut registry = TaskRegistry::new();
    registry.register(MODEL, move |ctx: TaskContext| {
        Box::new(CountTraining {
            inner: Echo::new(ctx),
            calls: counter.clone(),
        })
    });

    let dir = TempDir::new().unwrap();
    let router = Arc::new(InMemoryRouter::with_runs([run(
        "5",
        "site-p",
        Role::Participant,
        RunStatus::Running,
    )]));
    let site = Site::with_router(
        Config::local("site-p", dir.path()),
        router.clone(),
        registry,
    );

    let first = site.tick().await.unwrap();
    assert_eq!(
        first[0].outcome,
        StepOutcome::Transitioned(RunStatus::PendingSuccess)
    );

    // The router replays the old status and the cache has been lost.
    router.set_status("5", RunStatus::Running);
    site.cache().reset().await.unwrap();
    let second = site.tick().await.unwrap();
    assert_eq!(second[0].outcome, StepOutcome::Duplicate);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(router.transitions().len(), 1);
}

#[tokio::test]
async fn test_unconfirmed_push_is_redispatched_on_next_poll() {
    let batch = Batch::new(echo_registry());
    batch.router.set_offline(true);
    assert!(batch.participant.tick().await.is_err());

    batch.router.set_offline(false);
    let first = batch.participant.tick().await.unwrap();
    assert_eq!(first[0].outcome, StepOutcome::Transitioned(RunStatus::Preparing));

    // Offline only for the push: the step cannot confirm and the cached
    // snapshot is evicted, so the next poll retries it.
    let batch = Batch::new(echo_registry());
    let site = &batch.participant;
    let dispatches = site.detector().detect_changes().await.unwrap();
    batch.router.set_offline(true);
    let outcome = execute(
        site.machine(),
        site.cache(),
        &dispatches[0],
        Duration::from_secs(5),
    )
    .await;
    assert!(matches!(outcome, StepOutcome::Unconfirmed(_)));
    assert!(site.cache().cached("2").await.unwrap().is_none());
    batch.router.set_offline(false);

    let retried = site.tick().await.unwrap();
    assert_eq!(retried.len(), 1);
    assert_eq!(
        retried[0].outcome,
        StepOutcome::Transitioned(RunStatus::Preparing)
    );
}

#[tokio::test]
async fn test_inspecting_pending_runs_keeps_them_for_the_worker() {
    let dir = TempDir::new().unwrap();
    let router = Arc::new(InMemoryRouter::with_runs([run(
        "7",
        "site-p",
        Role::Participant,
        RunStatus::Standby,
    )]));
    let file_backed = || {
        let mut config = Config::local("site-p", dir.path());
        config.cache_backend = CacheBackend::File;
        Site::with_router(config, router.clone(), echo_registry())
    };

    // Two processes sharing one on-disk cache: an inspecting poll, then the worker.
    let inspector = file_backed();
    let listed = inspector.detector().preview_changes().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].run.id, "7");

    let worker = file_backed();
    let reports = worker.tick().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].outcome,
        StepOutcome::Transitioned(RunStatus::Preparing)
    );
}

#[tokio::test]
async fn test_multi_round_batch_advances_rounds() {
    let dir = TempDir::new().unwrap();
    let mut options = SimulationOptions::new(dir.path());
    options.rounds = 2;
    options.participants = 1;

    let report = run_simulation(&options, TaskRegistry::with_builtins())
        .await
        .unwrap();
    assert!(report.all_succeeded(), "{:?}", report);
    for site in &report.sites {
        assert_eq!(site.current_round, Some(2));
    }
    assert_eq!(report.uploads, 4);

    // Both rounds left their own artifacts on the coordinator.
    for round in 1..=2 {
        let path = dir
            .path()
            .join(format!("coordinator/artifacts/1/1/{}/artifacts.txt", round));
        assert!(path.exists(), "missing {}", path.display());
    }
}
