use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use crate::error::{FarmError, Result};
use crate::farm::protocol::{
    AddJobRequest, AddJobResponse, AssignRequest, ErrorBody, GetJobRequest, GetJobResponse,
    HeartbeatRequest, HeartbeatResponse, JobCompleteRequest, JobCompleteResponse, JobOutcome,
    JobProgress, QueueResponse, RegisterRequest, RegisterResponse, StatusResponse,
};
use crate::farm::transfer::bundle_project;
use crate::render::RenderSettings;
use crate::scheduler::job::{Job, JobId, NodeId};

/// Typed client for one farm master.
#[derive(Debug, Clone)]
pub struct FarmClient {
    http: Client,
    base_url: String,
    transfer_timeout: Duration,
}

/// Options for [`FarmClient::submit_job`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Upload the project to the master instead of sharing its path.
    pub bundle: bool,
    pub include_siblings: bool,
    pub max_bundle_bytes: usize,
    pub pinned_to: Option<NodeId>,
}

impl FarmClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration, transfer_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            transfer_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self.http.post(self.url(path)).json(body).send().await?;
        decode(resp).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.http.get(self.url(path)).send().await?;
        decode(resp).await
    }

    pub async fn register(&self, hostname: &str, port: u16, capacity: usize) -> Result<RegisterResponse> {
        self.post(
            "/api/register",
            &RegisterRequest {
                hostname: hostname.to_string(),
                port,
                capacity,
            },
        )
        .await
    }

    pub async fn heartbeat(&self, node_id: &NodeId, jobs: Vec<JobProgress>) -> Result<HeartbeatResponse> {
        self.post(
            "/api/heartbeat",
            &HeartbeatRequest {
                node_id: node_id.clone(),
                jobs,
            },
        )
        .await
    }

    pub async fn get_job(&self, node_id: &NodeId) -> Result<Option<Job>> {
        let resp: GetJobResponse = self
            .post(
                "/api/get_job",
                &GetJobRequest {
                    node_id: node_id.clone(),
                },
            )
            .await?;
        Ok(resp.job)
    }

    pub async fn job_complete(&self, node_id: &NodeId, job_id: &JobId, outcome: JobOutcome) -> Result<bool> {
        let resp: JobCompleteResponse = self
            .post(
                "/api/job_complete",
                &JobCompleteRequest {
                    node_id: node_id.clone(),
                    job_id: *job_id,
                    outcome,
                },
            )
            .await?;
        Ok(resp.accepted)
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        self.get("/api/status").await
    }

    pub async fn queue(&self) -> Result<QueueResponse> {
        self.get("/api/queue").await
    }

    pub async fn add_job(&self, req: &AddJobRequest) -> Result<JobId> {
        let resp: AddJobResponse = self.post("/api/add_job", req).await?;
        Ok(resp.job_id)
    }

    pub async fn cancel(&self, job_id: &JobId) -> Result<()> {
        let _: serde_json::Value = self
            .post(&format!("/api/jobs/{}/cancel", job_id), &json!({}))
            .await?;
        Ok(())
    }

    pub async fn assign(&self, job_id: &JobId, node_id: Option<NodeId>) -> Result<()> {
        let _: serde_json::Value = self
            .post(&format!("/api/jobs/{}/assign", job_id), &AssignRequest { node_id })
            .await?;
        Ok(())
    }

    pub async fn retry(&self, job_id: &JobId) -> Result<()> {
        let _: serde_json::Value = self
            .post(&format!("/api/jobs/{}/retry", job_id), &json!({}))
            .await?;
        Ok(())
    }

    pub async fn remove(&self, job_id: &JobId) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/api/jobs/{}", job_id)))
            .send()
            .await?;
        let _: serde_json::Value = decode(resp).await?;
        Ok(())
    }

    pub async fn upload_bundle(&self, job_id: &JobId, bytes: Vec<u8>) -> Result<()> {
        let resp = self
            .http
            .put(self.url(&format!("/api/transfer/{}", job_id)))
            .timeout(self.transfer_timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/zip")
            .body(bytes)
            .send()
            .await
            .map_err(|e| FarmError::Transfer(format!("upload failed: {}", e)))?;
        let _: serde_json::Value = decode(resp).await?;
        Ok(())
    }

    pub async fn download_bundle(&self, job_id: &JobId) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(self.url(&format!("/api/transfer/{}", job_id)))
            .timeout(self.transfer_timeout)
            .send()
            .await
            .map_err(|e| FarmError::Transfer(format!("download failed: {}", e)))?;
        let resp = check(resp).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FarmError::Transfer(format!("download failed: {}", e)))?;
        Ok(bytes.to_vec())
    }

    /// Put a project into the farm pool from any machine. With
    /// `options.bundle` the project (and its folder, if asked) is zipped and
    /// uploaded first, so nodes without access to the path can render it.
    pub async fn submit_job(
        &self,
        project: &Path,
        settings: RenderSettings,
        options: SubmitOptions,
    ) -> Result<JobId> {
        settings.validate()?;
        let job_id = JobId::new();
        if options.bundle {
            let path = project.to_path_buf();
            let bytes = tokio::task::spawn_blocking(move || {
                bundle_project(&path, options.include_siblings, options.max_bundle_bytes)
            })
            .await
            .map_err(|e| FarmError::Transfer(e.to_string()))??;
            tracing::info!(job_id = %job_id, bytes = bytes.len(), "Uploading project bundle");
            self.upload_bundle(&job_id, bytes).await?;
        }
        let project = absolute(project);
        self.add_job(&AddJobRequest {
            job_id: Some(job_id),
            project,
            settings,
            bundled: options.bundle,
            pinned_to: options.pinned_to,
        })
        .await
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Turn a non-success response into `FarmError::Api`.
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let body = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.error)
        .unwrap_or(text);
    Err(FarmError::Api {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let resp = check(resp).await?;
    Ok(resp.json::<T>().await?)
}
