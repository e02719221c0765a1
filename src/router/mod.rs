//! Router control-plane client.
//!
//! The router is the authoritative store of run status across sites. This
//! module is the only place that talks to it. Calls are single attempts: a
//! failed request surfaces as a [`RouterError`] and the next dispatch of the
//! run is the retry.
//!
//! ## Endpoints
//!
//! | Operation            | Request                                              |
//! |----------------------|------------------------------------------------------|
//! | `fetch_active_runs`  | `GET /runs/active/`                                  |
//! | `fetch_run_detail`   | `GET /runs/detail/?batch=&project=&site_uid=`        |
//! | `push_status`        | `PUT /runs/{id}/status/` body `{status, ...params}`  |
//! | `push_artifacts`     | `POST /runs-action/upload/` multipart                |

mod http;
mod memory;

pub use http::HttpRouterClient;
pub use memory::InMemoryRouter;

use crate::errors::RouterError;
use async_trait::async_trait;
use fedrun_common::{Run, RunStatus};
use serde_json::{Map, Value};

/// Parameter asking the router to advance the active step's `current_round`.
pub const INCREASE_ROUND_PARAM: &str = "increase_round";

/// A requested status change plus any extra parameters for the router.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub to: RunStatus,
    pub params: Map<String, Value>,
}

impl Transition {
    pub fn to(status: RunStatus) -> Self {
        Self {
            to: status,
            params: Map::new(),
        }
    }

    /// Ask the router to start the next round of the active step.
    pub fn with_increase_round(mut self) -> Self {
        self.params
            .insert(INCREASE_ROUND_PARAM.to_string(), Value::Bool(true));
        self
    }

    pub fn increases_round(&self) -> bool {
        self.params
            .get(INCREASE_ROUND_PARAM)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// JSON body for `PUT /runs/{id}/status/`.
    pub fn body(&self) -> Value {
        let mut body = self.params.clone();
        body.insert("status".to_string(), Value::from(self.to.code()));
        Value::Object(body)
    }
}

/// Files produced by one round, forwarded to the router for the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactUpload {
    pub run_id: String,
    pub task_seq: usize,
    pub round_seq: u64,
    pub logs: Option<Vec<u8>>,
    pub mid_artifacts: Option<Vec<u8>>,
}

impl ArtifactUpload {
    /// True when there is no file to send.
    pub fn is_empty(&self) -> bool {
        self.logs.is_none() && self.mid_artifacts.is_none()
    }
}

/// Request/response operations against the router.
#[async_trait]
pub trait RouterClient: Send + Sync {
    /// Every active run visible to the router, other sites' included.
    async fn fetch_active_runs(&self) -> Result<Vec<Run>, RouterError>;

    /// Every run of a batch within a project, as seen from `site_uid`.
    async fn fetch_run_detail(
        &self,
        batch: &str,
        project: &str,
        site_uid: &str,
    ) -> Result<Vec<Run>, RouterError>;

    /// The only way a run's status advances remotely.
    async fn push_status(&self, run_id: &str, transition: &Transition) -> Result<(), RouterError>;

    async fn push_artifacts(&self, upload: &ArtifactUpload) -> Result<(), RouterError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transition_body_carries_code() {
        let body = Transition::to(RunStatus::Preparing).body();
        assert_eq!(body, json!({"status": 3}));
    }

    #[test]
    fn test_increase_round_param() {
        let transition = Transition::to(RunStatus::Standby).with_increase_round();
        assert!(transition.increases_round());
        assert_eq!(
            transition.body(),
            json!({"status": 2, "increase_round": true})
        );
        assert!(!Transition::to(RunStatus::Success).increases_round());
    }

    #[test]
    fn test_empty_upload() {
        let upload = ArtifactUpload {
            run_id: "1".to_string(),
            task_seq: 1,
            round_seq: 1,
            logs: None,
            mid_artifacts: None,
        };
        assert!(upload.is_empty());
        let upload = ArtifactUpload {
            logs: Some(b"line\n".to_vec()),
            ..upload
        };
        assert!(!upload.is_empty());
    }
}
