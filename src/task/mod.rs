//! Task contract.
//!
//! A task handler supplies the computation behind each lifecycle state. The
//! state machine builds a fresh handler from a [`TaskContext`] immediately
//! before one step and drops it afterwards, so handlers hold no state across
//! steps beyond what they persist through the artifact store.
//!
//! Every hook answers `Ok(true)` on success. `Ok(false)`, an `Err`, or a panic
//! are all treated as failure by the caller.

mod echo;
pub mod registry;

pub use echo::Echo;
pub use registry::{TaskFactory, TaskRegistry};

use crate::artifacts::{ArtifactAddress, ArtifactKind, ArtifactStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use fedrun_common::Run;

#[async_trait]
pub trait FlTask: Send {
    /// Check that the site can take part in the run (Standby).
    async fn validate(&mut self) -> Result<bool>;

    /// Run local training for the current round (Running).
    async fn training(&mut self) -> Result<bool>;

    /// Coordinator only: collect the participants' round artifacts (PendingAggregating).
    async fn download_artifacts(&mut self) -> Result<bool>;

    /// Coordinator only: combine the round's artifacts (Aggregating).
    async fn do_aggregate(&mut self) -> Result<bool>;
}

/// Everything a handler sees of the outside world.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run: Run,
    pub artifacts: ArtifactStore,
    pub site_uid: String,
}

impl TaskContext {
    pub fn new(run: Run, artifacts: ArtifactStore, site_uid: impl Into<String>) -> Self {
        Self {
            run,
            artifacts,
            site_uid: site_uid.into(),
        }
    }

    /// Round used for artifact addressing (1 for single-round steps).
    pub fn current_round(&self) -> u64 {
        self.run.round_seq()
    }

    pub fn task_seq(&self) -> usize {
        self.run.cur_seq
    }

    pub fn address(&self) -> ArtifactAddress {
        ArtifactAddress::for_run(&self.run)
    }

    /// Append a line to this round's `logs.txt`.
    pub fn add_log(&self, line: &str) -> Result<()> {
        self.artifacts
            .append_log(&self.address(), line)
            .context("Failed to append task log")
    }

    pub fn write_mid_artifacts(&self, content: &[u8]) -> Result<()> {
        self.artifacts
            .write(&self.address(), ArtifactKind::MidArtifacts, content)
            .context("Failed to write mid-round artifacts")?;
        Ok(())
    }

    pub fn write_artifacts(&self, content: &[u8]) -> Result<()> {
        self.artifacts
            .write(&self.address(), ArtifactKind::Artifacts, content)
            .context("Failed to write round artifacts")?;
        Ok(())
    }

    pub fn read_mid_artifacts(&self) -> Result<Option<Vec<u8>>> {
        self.artifacts
            .read(&self.address(), ArtifactKind::MidArtifacts)
            .context("Failed to read mid-round artifacts")
    }
}
