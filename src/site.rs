//! One site's worker, assembled from configuration.

use crate::artifacts::ArtifactStore;
use crate::cache::{ChangeDetector, store_from_config};
use crate::config::Config;
use crate::dispatch::{self, Detector, Dispatch};
use crate::machine::{RunStateMachine, StepOutcome};
use crate::router::{HttpRouterClient, RouterClient};
use crate::task::TaskRegistry;
use anyhow::{Context, Result};
use fedrun_common::Run;
use std::future::Future;
use std::sync::Arc;

/// The result of driving one dispatch inline.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub run: Run,
    pub outcome: StepOutcome,
}

/// Router client, status cache, state machine and detector for one site.
#[derive(Clone)]
pub struct Site {
    config: Arc<Config>,
    router: Arc<dyn RouterClient>,
    cache: ChangeDetector,
    machine: RunStateMachine,
    detector: Detector,
}

impl Site {
    /// Site talking to the HTTP router named in `config`, with the built-in
    /// task models.
    pub fn from_config(config: Config) -> Result<Self> {
        let router = HttpRouterClient::new(&config.router)
            .context("Failed to build router client")?;
        Ok(Self::with_router(
            config,
            Arc::new(router),
            TaskRegistry::with_builtins(),
        ))
    }

    pub fn with_router(
        config: Config,
        router: Arc<dyn RouterClient>,
        registry: TaskRegistry,
    ) -> Self {
        let cache = ChangeDetector::new(store_from_config(&config), config.cache_ttl);
        let machine = RunStateMachine::new(
            config.site_uid.clone(),
            router.clone(),
            Arc::new(registry),
            ArtifactStore::new(config.artifact_root.clone()),
        );
        let detector = Detector::new(config.site_uid.clone(), router.clone(), cache.clone());
        Self {
            config: Arc::new(config),
            router,
            cache,
            machine,
            detector,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn site_uid(&self) -> &str {
        &self.config.site_uid
    }

    pub fn router(&self) -> &Arc<dyn RouterClient> {
        &self.router
    }

    pub fn cache(&self) -> &ChangeDetector {
        &self.cache
    }

    pub fn machine(&self) -> &RunStateMachine {
        &self.machine
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    /// One poll pass followed by its steps, executed inline in order.
    pub async fn tick(&self) -> Result<Vec<StepReport>> {
        let dispatches = self
            .detector
            .detect_changes()
            .await
            .context("Poll pass failed")?;
        Ok(self.execute_all(dispatches).await)
    }

    /// One monitor pass followed by its steps, executed inline in order.
    pub async fn monitor_tick(&self) -> Result<Vec<StepReport>> {
        let dispatches = self
            .detector
            .detect_stalled()
            .await
            .context("Monitor pass failed")?;
        Ok(self.execute_all(dispatches).await)
    }

    async fn execute_all(&self, dispatches: Vec<Dispatch>) -> Vec<StepReport> {
        let mut reports = Vec::with_capacity(dispatches.len());
        for dispatch in dispatches {
            let outcome = dispatch::execute(
                &self.machine,
                &self.cache,
                &dispatch,
                self.config.step_timeout,
            )
            .await;
            reports.push(StepReport {
                run: dispatch.run,
                outcome,
            });
        }
        reports
    }

    /// Run the worker daemon until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        dispatch::run_worker(
            &self.config,
            self.detector.clone(),
            self.machine.clone(),
            self.cache.clone(),
            shutdown,
        )
        .await
    }
}
