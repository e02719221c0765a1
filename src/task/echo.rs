use super::{FlTask, TaskContext};
use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::json;

/// Diagnostic model that exercises the whole lifecycle without doing any
/// learning. Each hook leaves a trace in the round's artifacts.
pub struct Echo {
    ctx: TaskContext,
}

impl Echo {
    pub const MODEL: &'static str = "Echo";

    pub fn new(ctx: TaskContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl FlTask for Echo {
    async fn validate(&mut self) -> Result<bool> {
        if self.ctx.run.active_step().is_none() {
            bail!(
                "run {} has no task step at cur_seq {}",
                self.ctx.run.id,
                self.ctx.run.cur_seq
            );
        }
        self.ctx.add_log(&format!("validate: site {} ready", self.ctx.site_uid))?;
        Ok(true)
    }

    async fn training(&mut self) -> Result<bool> {
        let round = self.ctx.current_round();
        self.ctx.add_log(&format!("training: round {}", round))?;
        let summary = json!({
            "site_uid": self.ctx.site_uid,
            "run": self.ctx.run.id,
            "task_seq": self.ctx.task_seq(),
            "round": round,
        });
        self.ctx.write_mid_artifacts(summary.to_string().as_bytes())?;
        Ok(true)
    }

    async fn download_artifacts(&mut self) -> Result<bool> {
        let dir = self.ctx.artifacts.round_dir(&self.ctx.address())?;
        Ok(dir.is_dir())
    }

    async fn do_aggregate(&mut self) -> Result<bool> {
        let round = self.ctx.current_round();
        let local = self
            .ctx
            .read_mid_artifacts()?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        let summary = json!({
            "run": self.ctx.run.id,
            "task_seq": self.ctx.task_seq(),
            "round": round,
            "aggregated_by": self.ctx.site_uid,
            "local": local,
        });
        self.ctx.write_artifacts(summary.to_string().as_bytes())?;
        self.ctx.add_log(&format!("aggregate: round {} done", round))?;
        Ok(true)
    }
}
