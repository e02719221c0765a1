//! Run lifecycle state machine.
//!
//! One call to [`RunStateMachine::step`] executes the logic of the status a
//! run snapshot is in, possibly calling the task handler, and pushes at most
//! one transition to the router. The pushed status becomes visible on the next
//! poll, which is what drives the following step.
//!
//! ```text
//!  Standby(2) ──validate──▶ Preparing(3) ══all══▶ Running(4) ──training──▶ PendingSuccess(5)
//!     ▲                                                                        │ upload
//!     │ increase_round                                                         ▼
//!  Aggregating(7) ◀══all + download══ PendingAggregating(6) ◀──────────────────┘
//!     ║ aggregate, last round
//!     ▼
//!  Success(8)          any failure ─▶ PendingFailed(1) ──upload──▶ Failed(0)
//! ```
//!
//! Double arrows are coordinator decisions taken from the batch view; a
//! participant only observes those states.

mod consensus;
mod ledger;
mod upload;

pub use consensus::{Consensus, assess};
pub use ledger::{StepKey, StepLedger};

use crate::artifacts::ArtifactStore;
use crate::errors::RegistryError;
use crate::observability::step_span;
use crate::router::{RouterClient, Transition};
use crate::task::{FlTask, TaskContext, TaskRegistry};
use fedrun_common::{Run, RunStatus};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::Instrument;

/// What one step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The router accepted a transition to this status
    Transitioned(RunStatus),
    /// A participant in a coordinator-driven state; nothing to do
    Observed,
    /// The coordinator's batch is not yet in sync
    Waiting,
    /// The step could not confirm its effect and must run again
    Unconfirmed(String),
    /// This exact step already settled
    Duplicate,
    /// The run is finished
    Terminal,
    /// The step cannot run at this site (unknown model, foreign run)
    Dropped(String),
}

impl StepOutcome {
    /// Whether the step reached a confirmed end and must not be repeated.
    pub fn settles(&self) -> bool {
        matches!(
            self,
            StepOutcome::Transitioned(_) | StepOutcome::Observed | StepOutcome::Terminal
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum Hook {
    Validate,
    Training,
    DownloadArtifacts,
    Aggregate,
}

impl Hook {
    fn name(self) -> &'static str {
        match self {
            Hook::Validate => "validate",
            Hook::Training => "training",
            Hook::DownloadArtifacts => "download_artifacts",
            Hook::Aggregate => "do_aggregate",
        }
    }

    fn call<'a>(self, task: &'a mut dyn FlTask) -> BoxFuture<'a, anyhow::Result<bool>> {
        match self {
            Hook::Validate => task.validate(),
            Hook::Training => task.training(),
            Hook::DownloadArtifacts => task.download_artifacts(),
            Hook::Aggregate => task.do_aggregate(),
        }
    }
}

/// Executes lifecycle steps for the runs of one site.
#[derive(Clone)]
pub struct RunStateMachine {
    site_uid: String,
    router: Arc<dyn RouterClient>,
    registry: Arc<TaskRegistry>,
    artifacts: ArtifactStore,
    ledger: Arc<StepLedger>,
}

impl RunStateMachine {
    pub fn new(
        site_uid: impl Into<String>,
        router: Arc<dyn RouterClient>,
        registry: Arc<TaskRegistry>,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            site_uid: site_uid.into(),
            router,
            registry,
            artifacts,
            ledger: Arc::new(StepLedger::new()),
        }
    }

    pub fn site_uid(&self) -> &str {
        &self.site_uid
    }

    pub fn ledger(&self) -> &StepLedger {
        &self.ledger
    }

    /// Execute the logic of `run.status` once.
    pub async fn step(&self, run: &Run) -> StepOutcome {
        let span = step_span(run);
        self.step_inner(run).instrument(span).await
    }

    async fn step_inner(&self, run: &Run) -> StepOutcome {
        if run.site_uid != self.site_uid {
            return StepOutcome::Dropped(format!("run belongs to site {}", run.site_uid));
        }

        if run.status.is_terminal() {
            if self.ledger.evict(&run.id) {
                tracing::debug!("Run finished, ledger entry released");
            }
            return StepOutcome::Terminal;
        }

        let key = StepKey::of(run);
        if !self.ledger.begin(&run.id, key) {
            tracing::debug!("Step already settled, skipping");
            return StepOutcome::Duplicate;
        }

        let outcome = match run.status {
            RunStatus::Standby => self.on_standby(run).await,
            RunStatus::Preparing => self.on_preparing(run).await,
            RunStatus::Running => self.on_running(run).await,
            RunStatus::PendingSuccess => self.on_pending_success(run).await,
            RunStatus::PendingAggregating => self.on_pending_aggregating(run).await,
            RunStatus::Aggregating => self.on_aggregating(run).await,
            RunStatus::PendingFailed => self.on_pending_failed(run).await,
            RunStatus::Failed | RunStatus::Success => StepOutcome::Terminal,
        };

        if outcome.settles() {
            self.ledger.settle(&run.id, key);
        }
        tracing::debug!(outcome = ?outcome, "Step finished");
        outcome
    }

    async fn on_standby(&self, run: &Run) -> StepOutcome {
        match self.call_task(run, Hook::Validate).await {
            Ok(true) => self.request(run, Transition::to(RunStatus::Preparing)).await,
            Ok(false) => self.request(run, Transition::to(RunStatus::PendingFailed)).await,
            Err(err) => Self::dropped(err),
        }
    }

    async fn on_preparing(&self, run: &Run) -> StepOutcome {
        if !run.is_coordinator() {
            return StepOutcome::Observed;
        }
        match self.batch_consensus(run, RunStatus::Preparing).await {
            Consensus::Failed => self.request(run, Transition::to(RunStatus::Failed)).await,
            Consensus::Ready => self.request(run, Transition::to(RunStatus::Running)).await,
            Consensus::Waiting => StepOutcome::Waiting,
        }
    }

    async fn on_running(&self, run: &Run) -> StepOutcome {
        match self.call_task(run, Hook::Training).await {
            Ok(true) => {
                self.request(run, Transition::to(RunStatus::PendingSuccess))
                    .await
            }
            Ok(false) => self.request(run, Transition::to(RunStatus::PendingFailed)).await,
            Err(err) => Self::dropped(err),
        }
    }

    async fn on_pending_success(&self, run: &Run) -> StepOutcome {
        if let Err(reason) = self.upload(run).await {
            return StepOutcome::Unconfirmed(reason);
        }
        self.request(run, Transition::to(RunStatus::PendingAggregating))
            .await
    }

    async fn on_pending_aggregating(&self, run: &Run) -> StepOutcome {
        if !run.is_coordinator() {
            return StepOutcome::Observed;
        }
        match self
            .batch_consensus(run, RunStatus::PendingAggregating)
            .await
        {
            Consensus::Failed => self.request(run, Transition::to(RunStatus::Failed)).await,
            Consensus::Waiting => StepOutcome::Waiting,
            Consensus::Ready => match self.call_task(run, Hook::DownloadArtifacts).await {
                Ok(true) => {
                    self.request(run, Transition::to(RunStatus::Aggregating))
                        .await
                }
                Ok(false) => {
                    tracing::info!("Artifacts not available yet, waiting");
                    StepOutcome::Waiting
                }
                Err(err) => Self::dropped(err),
            },
        }
    }

    async fn on_aggregating(&self, run: &Run) -> StepOutcome {
        if !run.is_coordinator() {
            return StepOutcome::Observed;
        }
        match self.batch_consensus(run, RunStatus::Aggregating).await {
            Consensus::Failed => self.request(run, Transition::to(RunStatus::Failed)).await,
            Consensus::Waiting => StepOutcome::Waiting,
            Consensus::Ready => match self.call_task(run, Hook::Aggregate).await {
                Ok(true) if run.is_last_round() => {
                    self.request(run, Transition::to(RunStatus::Success)).await
                }
                Ok(true) => {
                    let next = Transition::to(RunStatus::Standby).with_increase_round();
                    self.request(run, next).await
                }
                Ok(false) => self.request(run, Transition::to(RunStatus::Failed)).await,
                Err(err) => Self::dropped(err),
            },
        }
    }

    async fn on_pending_failed(&self, run: &Run) -> StepOutcome {
        if let Err(reason) = self.upload(run).await {
            return StepOutcome::Unconfirmed(reason);
        }
        self.request(run, Transition::to(RunStatus::Failed)).await
    }

    /// Push a transition; a rejected or failed push leaves the step unsettled.
    async fn request(&self, run: &Run, transition: Transition) -> StepOutcome {
        match self.router.push_status(&run.id, &transition).await {
            Ok(()) => {
                tracing::info!(
                    from = %run.status,
                    to = %transition.to,
                    increase_round = transition.increases_round(),
                    "Transition accepted"
                );
                StepOutcome::Transitioned(transition.to)
            }
            Err(err) => {
                tracing::warn!(to = %transition.to, error = %err, "Could not confirm transition");
                StepOutcome::Unconfirmed(err.to_string())
            }
        }
    }

    /// Forward the round's logs and mid-artifacts. Nothing to send counts as
    /// success.
    async fn upload(&self, run: &Run) -> Result<(), String> {
        let upload = upload::gather(self.artifacts.clone(), run.clone())
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, "Failed to read round artifacts");
                err.to_string()
            })?;
        if upload.is_empty() {
            tracing::debug!("No round artifacts to upload");
            return Ok(());
        }
        self.router.push_artifacts(&upload).await.map_err(|err| {
            tracing::warn!(error = %err, "Artifact upload failed");
            err.to_string()
        })?;
        tracing::info!(
            logs = upload.logs.is_some(),
            mid_artifacts = upload.mid_artifacts.is_some(),
            "Round artifacts uploaded"
        );
        Ok(())
    }

    /// Current view of the batch. A failed fetch is "not yet in sync".
    async fn batch_consensus(&self, run: &Run, target: RunStatus) -> Consensus {
        let siblings = match self
            .router
            .fetch_run_detail(&run.batch_id, &run.project_id, &self.site_uid)
            .await
        {
            Ok(siblings) => siblings,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to fetch batch view, waiting");
                return Consensus::Waiting;
            }
        };

        let consensus = assess(&siblings, target);
        if consensus == Consensus::Waiting {
            tracing::info!(
                target = %target,
                pending = ?consensus::laggards(&siblings, target),
                "Waiting on sibling sites"
            );
        }
        consensus
    }

    /// Run one task hook on a fresh handler. `Ok(false)` covers an explicit
    /// refusal, an error and a panic alike.
    async fn call_task(&self, run: &Run, hook: Hook) -> Result<bool, RegistryError> {
        let ctx = TaskContext::new(run.clone(), self.artifacts.clone(), self.site_uid.clone());
        let mut task = self.registry.instantiate(run, ctx)?;

        let result = AssertUnwindSafe(hook.call(task.as_mut()))
            .catch_unwind()
            .await;
        let model = run.model().unwrap_or_default();
        Ok(match result {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                tracing::warn!(model, hook = hook.name(), "Task reported failure");
                false
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    model,
                    hook = hook.name(),
                    error = %format!("{:#}", err),
                    "Task failed"
                );
                false
            }
            Err(panic) => {
                tracing::error!(
                    model,
                    hook = hook.name(),
                    panic = panic_message(panic.as_ref()),
                    "Task panicked"
                );
                false
            }
        })
    }

    fn dropped(err: RegistryError) -> StepOutcome {
        tracing::warn!(error = %err, "No handler for run, dropping dispatch");
        StepOutcome::Dropped(err.to_string())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
