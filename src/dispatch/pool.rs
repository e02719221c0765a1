use super::Dispatch;
use crate::cache::ChangeDetector;
use crate::machine::{RunStateMachine, StepOutcome};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Stable partition index for a run id (FNV-1a), independent of process and
/// platform.
pub fn partition_for(run_id: &str, partitions: usize) -> usize {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    let hash = run_id
        .bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME));
    (hash % partitions.max(1) as u64) as usize
}

/// Run one step under the step timeout. A step that timed out or could not
/// confirm its transition has its cached snapshot evicted so that the next
/// poll dispatches it again.
pub async fn execute(
    machine: &RunStateMachine,
    cache: &ChangeDetector,
    dispatch: &Dispatch,
    step_timeout: Duration,
) -> StepOutcome {
    let run = &dispatch.run;
    let outcome = match tokio::time::timeout(step_timeout, machine.step(run)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::warn!(
                run_id = %run.id,
                status = %run.status,
                timeout_secs = step_timeout.as_secs(),
                "Step timed out"
            );
            StepOutcome::Unconfirmed(format!("step timed out after {:?}", step_timeout))
        }
    };

    if matches!(outcome, StepOutcome::Unconfirmed(_)) {
        cache.forget(&run.id).await;
    }
    outcome
}

/// Fixed set of execution partitions, each drained by one task.
pub struct WorkerPool {
    senders: Vec<mpsc::Sender<Dispatch>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        machine: RunStateMachine,
        cache: ChangeDetector,
        partitions: usize,
        queue_depth: usize,
        step_timeout: Duration,
    ) -> Self {
        let partitions = partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        let mut handles = Vec::with_capacity(partitions);

        for index in 0..partitions {
            let (tx, rx) = mpsc::channel(queue_depth.max(1));
            let machine = machine.clone();
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                drain_partition(index, rx, machine, cache, step_timeout).await;
            }));
            senders.push(tx);
        }

        Self { senders, handles }
    }

    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    /// Queue a dispatch on its run's partition. Waits while the partition is
    /// full. Returns `false` if the partition has shut down.
    pub async fn submit(&self, dispatch: Dispatch) -> bool {
        let index = partition_for(&dispatch.run.id, self.senders.len());
        let run_id = dispatch.run.id.clone();
        match self.senders[index].send(dispatch).await {
            Ok(()) => true,
            Err(_) => {
                tracing::error!(run_id = %run_id, partition = index, "Partition closed, dispatch lost");
                false
            }
        }
    }

    /// Close every partition and wait for queued steps to finish.
    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "Partition worker ended abnormally");
            }
        }
    }
}

async fn drain_partition(
    index: usize,
    mut rx: mpsc::Receiver<Dispatch>,
    machine: RunStateMachine,
    cache: ChangeDetector,
    step_timeout: Duration,
) {
    tracing::debug!(partition = index, "Partition worker started");
    while let Some(dispatch) = rx.recv().await {
        let outcome = execute(&machine, &cache, &dispatch, step_timeout).await;
        tracing::debug!(
            partition = index,
            run_id = %dispatch.run.id,
            trigger = %dispatch.trigger,
            outcome = ?outcome,
            "Dispatch handled"
        );
    }
    tracing::debug!(partition = index, "Partition worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactStore;
    use crate::cache::{DEFAULT_TTL, MemorySnapshotStore};
    use crate::dispatch::Trigger;
    use crate::router::InMemoryRouter;
    use crate::task::{FlTask, TaskRegistry};
    use anyhow::Result;
    use async_trait::async_trait;
    use fedrun_common::{Role, Run, RunStatus, TaskStep};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Training that sleeps longer than any test timeout.
    struct Slow;

    #[async_trait]
    impl FlTask for Slow {
        async fn validate(&mut self) -> Result<bool> {
            Ok(true)
        }
        async fn training(&mut self) -> Result<bool> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(true)
        }
        async fn download_artifacts(&mut self) -> Result<bool> {
            Ok(true)
        }
        async fn do_aggregate(&mut self) -> Result<bool> {
            Ok(true)
        }
    }

    /// Tracks the maximum number of concurrent `validate` calls.
    struct Gauge {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FlTask for Gauge {
        async fn validate(&mut self) -> Result<bool> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(true)
        }
        async fn training(&mut self) -> Result<bool> {
            Ok(true)
        }
        async fn download_artifacts(&mut self) -> Result<bool> {
            Ok(true)
        }
        async fn do_aggregate(&mut self) -> Result<bool> {
            Ok(true)
        }
    }

    fn run(id: &str, model: &str, status: RunStatus) -> Run {
        Run {
            id: id.to_string(),
            site_uid: "site-a".to_string(),
            role: Role::Participant,
            status,
            tasks: vec![TaskStep::new(model)],
            cur_seq: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_partition_is_stable_and_in_range() {
        for id in ["1", "42", "run-abc", ""] {
            let p = partition_for(id, 4);
            assert!(p < 4);
            assert_eq!(p, partition_for(id, 4));
        }
        assert_eq!(partition_for("anything", 1), 0);
        assert_eq!(partition_for("anything", 0), 0);
    }

    #[tokio::test]
    async fn test_timed_out_step_is_unconfirmed_and_forgotten() {
        let dir = tempdir().unwrap();
        let snapshot = run("1", "Slow", RunStatus::Running);
        let router = Arc::new(InMemoryRouter::with_runs([snapshot.clone()]));
        let mut registry = TaskRegistry::new();
        registry.register("Slow", |_| Box::new(Slow));
        let machine = RunStateMachine::new(
            "site-a",
            router.clone(),
            Arc::new(registry),
            ArtifactStore::new(dir.path()),
        );
        let cache = ChangeDetector::new(Arc::new(MemorySnapshotStore::new()), DEFAULT_TTL);
        cache
            .check_and_record(std::slice::from_ref(&snapshot), "site-a")
            .await;

        let dispatch = Dispatch::new(snapshot, Trigger::Poll);
        let outcome = execute(&machine, &cache, &dispatch, Duration::from_millis(20)).await;
        assert!(matches!(outcome, StepOutcome::Unconfirmed(_)));
        assert!(cache.cached("1").await.unwrap().is_none());
        assert!(router.transitions().is_empty());
    }

    #[tokio::test]
    async fn test_same_run_never_overlaps() {
        let dir = tempdir().unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        let (a, p) = (active.clone(), peak.clone());
        registry.register("Gauge", move |_| {
            Box::new(Gauge {
                active: a.clone(),
                peak: p.clone(),
            })
        });

        let snapshot = run("7", "Gauge", RunStatus::Standby);
        // The router is offline so no step settles and every dispatch runs.
        let router = Arc::new(InMemoryRouter::with_runs([snapshot.clone()]));
        router.set_offline(true);
        let machine = RunStateMachine::new(
            "site-a",
            router,
            Arc::new(registry),
            ArtifactStore::new(dir.path()),
        );
        let cache = ChangeDetector::new(Arc::new(MemorySnapshotStore::new()), DEFAULT_TTL);
        let pool = WorkerPool::spawn(machine, cache, 4, 8, Duration::from_secs(5));
        assert_eq!(pool.partitions(), 4);

        for _ in 0..5 {
            assert!(pool.submit(Dispatch::new(snapshot.clone(), Trigger::Poll)).await);
        }
        pool.shutdown().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }
}
