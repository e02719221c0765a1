use super::{ArtifactUpload, RouterClient, Transition};
use crate::errors::RouterError;
use async_trait::async_trait;
use fedrun_common::{Run, RunStatus};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct RouterState {
    runs: BTreeMap<String, Run>,
    transitions: Vec<(String, Transition)>,
    uploads: Vec<ArtifactUpload>,
    offline: bool,
    reject_uploads: bool,
}

/// Process-local router.
///
/// Emulates the batch-level behaviour of the real control plane so that
/// several sites can be driven against it in one process:
/// - a coordinator's `Running`, `Aggregating`, `Standby`, `Success` and `Failed`
///   transitions apply to every non-terminal run of its batch;
/// - `increase_round` advances every run in the batch to the next round of its
///   active step, or to the next task step once the active one is done.
#[derive(Debug, Default)]
pub struct InMemoryRouter {
    state: Mutex<RouterState>,
}

impl InMemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runs(runs: impl IntoIterator<Item = Run>) -> Self {
        let router = Self::new();
        for run in runs {
            router.insert_run(run);
        }
        router
    }

    // The lock is never held across an await, so poisoning can only follow a
    // panic inside this module; the state is still usable.
    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_run(&self, run: Run) {
        self.lock().runs.insert(run.id.clone(), run);
    }

    pub fn run(&self, run_id: &str) -> Option<Run> {
        self.lock().runs.get(run_id).cloned()
    }

    pub fn runs(&self) -> Vec<Run> {
        self.lock().runs.values().cloned().collect()
    }

    /// Overwrite a run's status without batch propagation.
    pub fn set_status(&self, run_id: &str, status: RunStatus) {
        if let Some(run) = self.lock().runs.get_mut(run_id) {
            run.status = status;
        }
    }

    /// Every accepted transition, in order, as `(run_id, transition)`.
    pub fn transitions(&self) -> Vec<(String, Transition)> {
        self.lock().transitions.clone()
    }

    pub fn uploads(&self) -> Vec<ArtifactUpload> {
        self.lock().uploads.clone()
    }

    /// While offline every call fails with HTTP 503.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn set_reject_uploads(&self, reject: bool) {
        self.lock().reject_uploads = reject;
    }

    fn check_online(state: &RouterState, url: &str) -> Result<(), RouterError> {
        if state.offline {
            return Err(RouterError::Status {
                url: url.to_string(),
                status: 503,
            });
        }
        Ok(())
    }

    fn propagates(status: RunStatus) -> bool {
        matches!(
            status,
            RunStatus::Running
                | RunStatus::Aggregating
                | RunStatus::Standby
                | RunStatus::Success
                | RunStatus::Failed
        )
    }
}

#[async_trait]
impl RouterClient for InMemoryRouter {
    async fn fetch_active_runs(&self) -> Result<Vec<Run>, RouterError> {
        let state = self.lock();
        Self::check_online(&state, "memory:/runs/active/")?;
        Ok(state.runs.values().cloned().collect())
    }

    async fn fetch_run_detail(
        &self,
        batch: &str,
        project: &str,
        _site_uid: &str,
    ) -> Result<Vec<Run>, RouterError> {
        let state = self.lock();
        Self::check_online(&state, "memory:/runs/detail/")?;
        Ok(state
            .runs
            .values()
            .filter(|r| r.batch_id == batch && r.project_id == project)
            .cloned()
            .collect())
    }

    async fn push_status(&self, run_id: &str, transition: &Transition) -> Result<(), RouterError> {
        let mut state = self.lock();
        Self::check_online(&state, "memory:/runs/status/")?;

        let Some(run) = state.runs.get(run_id).cloned() else {
            return Err(RouterError::UnknownRun {
                run_id: run_id.to_string(),
            });
        };
        if run.status.is_terminal() {
            return Err(RouterError::Rejected {
                run_id: run_id.to_string(),
                status: transition.to,
                reason: format!("run is already {}", run.status),
            });
        }

        let batch_wide = run.is_coordinator() && Self::propagates(transition.to);
        for other in state.runs.values_mut() {
            let same_batch = other.batch_id == run.batch_id && other.project_id == run.project_id;
            let targeted = other.id == run.id || (batch_wide && same_batch);
            if !targeted {
                continue;
            }
            if transition.increases_round() && same_batch {
                other.advance_round();
            }
            if other.id == run.id || !other.status.is_terminal() {
                other.status = transition.to;
            }
        }

        state
            .transitions
            .push((run_id.to_string(), transition.clone()));
        Ok(())
    }

    async fn push_artifacts(&self, upload: &ArtifactUpload) -> Result<(), RouterError> {
        let mut state = self.lock();
        Self::check_online(&state, "memory:/runs-action/upload/")?;
        if !state.runs.contains_key(&upload.run_id) {
            return Err(RouterError::UnknownRun {
                run_id: upload.run_id.clone(),
            });
        }
        if state.reject_uploads {
            return Err(RouterError::Status {
                url: "memory:/runs-action/upload/".to_string(),
                status: 400,
            });
        }
        state.uploads.push(upload.clone());
        Ok(())
    }
}
