use super::{ArtifactUpload, RouterClient, Transition};
use crate::config::RouterSettings;
use crate::errors::RouterError;
use async_trait::async_trait;
use fedrun_common::Run;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;

/// Body of `GET /runs/detail/`.
#[derive(Debug, Deserialize)]
struct RunDetailResponse {
    #[serde(default)]
    runs: Vec<Value>,
}

/// Decode each run on its own. An entry this build cannot read (unknown
/// status code or role) is skipped so the rest of the list still arrives.
fn decode_runs(url: &str, entries: Vec<Value>) -> Vec<Run> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let run_id = entry.get("id").map(Value::to_string).unwrap_or_default();
            match serde_json::from_value::<Run>(entry) {
                Ok(run) => Some(run),
                Err(err) => {
                    tracing::warn!(
                        url,
                        run_id = %run_id,
                        error = %err,
                        "Skipping undecodable run"
                    );
                    None
                }
            }
        })
        .collect()
}

/// Router client over HTTP with basic auth and a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpRouterClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpRouterClient {
    pub fn new(settings: &RouterSettings) -> Result<Self, RouterError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("fedrun/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| RouterError::Request(err.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request, mapping transport failures and non-2xx statuses.
    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RouterError> {
        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|source| RouterError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RouterError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        url: &str,
        response: reqwest::Response,
    ) -> Result<T, RouterError> {
        let bytes = response
            .bytes()
            .await
            .map_err(|source| RouterError::Transport {
                url: url.to_string(),
                source,
            })?;
        serde_json::from_slice(&bytes).map_err(|err| RouterError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

#[async_trait]
impl RouterClient for HttpRouterClient {
    async fn fetch_active_runs(&self) -> Result<Vec<Run>, RouterError> {
        let url = self.url("/runs/active/");
        let response = self.send(&url, self.client.get(&url)).await?;
        let entries: Vec<Value> = Self::decode(&url, response).await?;
        Ok(decode_runs(&url, entries))
    }

    async fn fetch_run_detail(
        &self,
        batch: &str,
        project: &str,
        site_uid: &str,
    ) -> Result<Vec<Run>, RouterError> {
        let url = self.url("/runs/detail/");
        let request = self.client.get(&url).query(&[
            ("batch", batch),
            ("project", project),
            ("site_uid", site_uid),
        ]);
        let response = self.send(&url, request).await?;
        let detail: RunDetailResponse = Self::decode(&url, response).await?;
        Ok(decode_runs(&url, detail.runs))
    }

    async fn push_status(&self, run_id: &str, transition: &Transition) -> Result<(), RouterError> {
        let url = self.url(&format!("/runs/{}/status/", run_id));
        let request = self.client.put(&url).json(&transition.body());
        self.send(&url, request).await?;
        Ok(())
    }

    async fn push_artifacts(&self, upload: &ArtifactUpload) -> Result<(), RouterError> {
        let url = self.url("/runs-action/upload/");

        let mut form = Form::new()
            .text("run", upload.run_id.clone())
            .text("task_seq", upload.task_seq.to_string())
            .text("round_seq", upload.round_seq.to_string());
        if let Some(logs) = &upload.logs {
            form = form.part("logs", Part::bytes(logs.clone()).file_name("logs.txt"));
        }
        if let Some(mid) = &upload.mid_artifacts {
            form = form.part(
                "mid_artifacts",
                Part::bytes(mid.clone()).file_name("mid-artifacts.txt"),
            );
        }

        let request = self.client.post(&url).multipart(form);
        self.send(&url, request).await?;
        Ok(())
    }
}
