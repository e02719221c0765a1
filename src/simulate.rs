//! In-process run lifecycle: one coordinator and N participants driven
//! against an [`InMemoryRouter`] until every run is terminal.

use crate::config::Config;
use crate::router::InMemoryRouter;
use crate::site::Site;
use crate::task::{Echo, TaskRegistry};
use anyhow::{Result, bail};
use fedrun_common::{Role, Run, RunStatus, TaskStep};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

const PROJECT_ID: &str = "sim";
const BATCH_ID: &str = "1";

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub participants: usize,
    /// Rounds of the single task step; 1 makes it a single-round step
    pub rounds: u64,
    pub model: String,
    /// Upper bound on poll/monitor passes per site
    pub max_ticks: usize,
    /// Each site gets its own state and artifact directory below this
    pub state_dir: PathBuf,
}

impl SimulationOptions {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            participants: 1,
            rounds: 1,
            model: Echo::MODEL.to_string(),
            max_ticks: 50,
            state_dir: state_dir.into(),
        }
    }
}

/// Final state of one site's run.
#[derive(Debug, Clone, Serialize)]
pub struct SiteSummary {
    pub site_uid: String,
    pub run_id: String,
    pub role: Role,
    pub status: RunStatus,
    pub current_round: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub ticks: usize,
    pub transitions: usize,
    pub uploads: usize,
    pub sites: Vec<SiteSummary>,
}

impl SimulationReport {
    pub fn all_succeeded(&self) -> bool {
        self.sites.iter().all(|s| s.status == RunStatus::Success)
    }
}

/// The runs of one simulated batch, coordinator first.
pub fn batch_runs(options: &SimulationOptions) -> Vec<Run> {
    let step = if options.rounds > 1 {
        TaskStep::new(options.model.clone()).with_rounds(options.rounds, 1)
    } else {
        TaskStep::new(options.model.clone())
    };

    (0..=options.participants)
        .map(|index| {
            let (site_uid, role) = if index == 0 {
                ("coordinator".to_string(), Role::Coordinator)
            } else {
                (format!("participant-{}", index), Role::Participant)
            };
            Run {
                id: (index + 1).to_string(),
                project_id: PROJECT_ID.to_string(),
                batch_id: BATCH_ID.to_string(),
                site_uid,
                role,
                status: RunStatus::Standby,
                tasks: vec![step.clone()],
                cur_seq: 1,
                ..Default::default()
            }
        })
        .collect()
}

/// Drive every site until all runs are terminal or `max_ticks` is reached.
pub async fn run_simulation(
    options: &SimulationOptions,
    registry: TaskRegistry,
) -> Result<SimulationReport> {
    if !registry.contains(&options.model) {
        bail!(
            "Unknown model '{}' (known: {})",
            options.model,
            registry.models().join(", ")
        );
    }

    let runs = batch_runs(options);
    let router = Arc::new(InMemoryRouter::with_runs(runs.clone()));
    let sites: Vec<Site> = runs
        .iter()
        .map(|run| {
            let config = Config::local(&run.site_uid, &options.state_dir.join(&run.site_uid));
            Site::with_router(config, router.clone(), registry.clone())
        })
        .collect();

    let mut ticks = 0;
    while ticks < options.max_ticks {
        ticks += 1;
        for site in &sites {
            site.tick().await?;
            site.monitor_tick().await?;
        }
        if router.runs().iter().all(|run| run.status.is_terminal()) {
            break;
        }
    }

    let sites = router
        .runs()
        .into_iter()
        .map(|run| SiteSummary {
            current_round: run.current_round(),
            site_uid: run.site_uid,
            run_id: run.id,
            role: run.role,
            status: run.status,
        })
        .collect();
    tracing::info!(ticks, "Simulation finished");

    Ok(SimulationReport {
        ticks,
        transitions: router.transitions().len(),
        uploads: router.uploads().len(),
        sites,
    })
}
