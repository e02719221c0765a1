//! Run snapshots as served by the router.
//!
//! A [`Run`] is one site's copy of a batch execution. The router owns it; a site
//! only ever sees snapshots, so unknown fields are carried through untouched in
//! `extra` and survive a serialize/deserialize cycle through the status cache.

use crate::status::RunStatus;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Config key holding the number of rounds a multi-round step runs.
pub const TOTAL_ROUND_KEY: &str = "total_round";
/// Config key holding the round the step is currently in (1-based).
pub const CURRENT_ROUND_KEY: &str = "current_round";

/// Role a site plays in a run. Fixed for the lifetime of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Coordinator,
    #[default]
    Participant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Coordinator => write!(f, "coordinator"),
            Role::Participant => write!(f, "participant"),
        }
    }
}

/// One stage of a run's task sequence.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskStep {
    /// Registry identifier of the handler that executes this step
    pub model: String,
    /// Open configuration map; `total_round`/`current_round` mark a multi-round step
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskStep {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Builder for a multi-round step starting at `current_round`.
    pub fn with_rounds(mut self, total_round: u64, current_round: u64) -> Self {
        self.config
            .insert(TOTAL_ROUND_KEY.to_string(), Value::from(total_round));
        self.config
            .insert(CURRENT_ROUND_KEY.to_string(), Value::from(current_round));
        self
    }

    pub fn total_round(&self) -> Option<u64> {
        self.config.get(TOTAL_ROUND_KEY).and_then(round_value)
    }

    pub fn current_round(&self) -> Option<u64> {
        self.config.get(CURRENT_ROUND_KEY).and_then(round_value)
    }

    pub fn set_current_round(&mut self, round: u64) {
        self.config
            .insert(CURRENT_ROUND_KEY.to_string(), Value::from(round));
    }

    /// A step is multi-round only when both round keys are present.
    pub fn is_multi_round(&self) -> bool {
        self.total_round().is_some() && self.current_round().is_some()
    }

    /// Single-round steps are always on their last round.
    pub fn is_last_round(&self) -> bool {
        match (self.total_round(), self.current_round()) {
            (Some(total), Some(current)) => current >= total,
            _ => true,
        }
    }
}

/// Round counters may arrive as JSON numbers or numeric strings.
fn round_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A site's snapshot of one run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Run {
    #[serde(with = "opaque_id")]
    pub id: String,
    #[serde(default, rename = "project", with = "opaque_id")]
    pub project_id: String,
    #[serde(default, rename = "batch", with = "opaque_id")]
    pub batch_id: String,
    #[serde(default)]
    pub site_uid: String,
    #[serde(default)]
    pub role: Role,
    pub status: RunStatus,
    #[serde(default)]
    pub tasks: Vec<TaskStep>,
    /// 1-based index into `tasks`
    #[serde(default = "default_cur_seq")]
    pub cur_seq: usize,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_cur_seq() -> usize {
    1
}

impl Run {
    pub fn is_coordinator(&self) -> bool {
        self.role == Role::Coordinator
    }

    /// The task step `cur_seq` points at, if it is in range.
    pub fn active_step(&self) -> Option<&TaskStep> {
        self.cur_seq
            .checked_sub(1)
            .and_then(|index| self.tasks.get(index))
    }

    pub fn active_step_mut(&mut self) -> Option<&mut TaskStep> {
        self.cur_seq
            .checked_sub(1)
            .and_then(|index| self.tasks.get_mut(index))
    }

    /// Model identifier of the active step.
    pub fn model(&self) -> Option<&str> {
        self.active_step().map(|step| step.model.as_str())
    }

    /// `current_round` of the active step, when it declares one.
    pub fn current_round(&self) -> Option<u64> {
        self.active_step().and_then(TaskStep::current_round)
    }

    /// Round used to address artifacts. Single-round steps use round 1.
    pub fn round_seq(&self) -> u64 {
        self.current_round().unwrap_or(1)
    }

    /// Whether the run has nothing left to execute after the current round.
    ///
    /// Only the final task step can be on the last round; an earlier step is
    /// never last, so the coordinator asks the router to move on instead of
    /// finishing the run. A `cur_seq` past the end of `tasks` (or zero) means
    /// there is nothing left to run.
    pub fn is_last_round(&self) -> bool {
        if self.has_later_steps() {
            return false;
        }
        match self.active_step() {
            Some(step) => step.is_last_round(),
            None => true,
        }
    }

    /// True when `tasks` holds steps after the active one.
    pub fn has_later_steps(&self) -> bool {
        self.cur_seq >= 1 && self.cur_seq < self.tasks.len()
    }

    /// Move to the next round of the active step, or to the first round of
    /// the next step once the active one has run all its rounds. Returns
    /// false when there is nowhere to go.
    pub fn advance_round(&mut self) -> bool {
        let step_done = self.active_step().is_none_or(TaskStep::is_last_round);
        if !step_done {
            if let Some(step) = self.active_step_mut() {
                if let Some(round) = step.current_round() {
                    step.set_current_round(round + 1);
                    return true;
                }
            }
        }
        if self.has_later_steps() {
            self.cur_seq += 1;
            return true;
        }
        false
    }
}

/// Router identifiers are integers in practice but are treated as opaque
/// strings here. Accepts either form on input, always writes a string.
mod opaque_id {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Int(i64),
        Text(String),
    }

    pub fn serialize<S>(id: &str, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(id)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match RawId::deserialize(deserializer)? {
            RawId::Int(n) => n.to_string(),
            RawId::Text(s) => s,
        })
    }
}
