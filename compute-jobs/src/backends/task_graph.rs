//! Task graph adapter for Dask-style distributed schedulers.
//!
//! The job id is used as the task key, so the scheduler itself deduplicates
//! a resubmission and the handle equals the correlation token.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::http::{authorize, endpoint_url, json, send};
use super::{
    AdapterError, AdapterResult, BackendAdapter, BackendState, BackendStatus, SubmitRequest,
    Submission,
};
use crate::domain::{BackendKind, FileTransfer, ResourceRequirements};
use crate::scheduler::SchedulerEndpoint;

#[derive(Debug, Serialize)]
struct TaskBody<'a> {
    key: &'a str,
    command: &'a str,
    args: &'a [String],
    env: &'a BTreeMap<String, String>,
    resources: TaskResources,
    workdir: String,
    /// Staged into `workdir` by the worker before the task runs.
    input_files: &'a [FileTransfer],
    /// Delivered from `workdir` by the worker after a successful run.
    output_files: &'a [FileTransfer],
}

/// Worker resource restrictions, in Dask's naming.
#[derive(Debug, Serialize)]
struct TaskResources {
    #[serde(rename = "CPU")]
    cpu: u32,
    #[serde(rename = "MEMORY")]
    memory: u64,
    #[serde(rename = "GPU", skip_serializing_if = "Option::is_none")]
    gpu: Option<u32>,
}

impl From<&ResourceRequirements> for TaskResources {
    fn from(r: &ResourceRequirements) -> Self {
        Self {
            cpu: r.cpus,
            memory: r.memory_mb.saturating_mul(1024 * 1024),
            gpu: r.gpus,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TaskInfo {
    key: String,
    state: String,
    #[serde(default)]
    exception: Option<String>,
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    worker: Option<String>,
}

impl TaskInfo {
    fn into_status(self) -> AdapterResult<BackendStatus> {
        let state = match self.state.as_str() {
            "released" | "waiting" | "queued" | "no-worker" => BackendState::Queued,
            "processing" => BackendState::Running,
            "memory" => BackendState::Completed {
                exit_code: self.exit_code.unwrap_or(0),
            },
            "erred" => BackendState::Failed {
                reason: self
                    .exception
                    .clone()
                    .unwrap_or_else(|| "task erred".to_string()),
            },
            "cancelled" | "forgotten" => BackendState::Removed,
            other => {
                return Err(AdapterError::Transient(format!(
                    "task {} reports unknown state '{}'",
                    self.key, other
                )));
            }
        };
        let mut status = BackendStatus::new(state).with_metadata("task_state", self.state);
        if let Some(worker) = self.worker {
            status = status.with_metadata("worker", worker);
        }
        Ok(status)
    }
}

/// Adapter for Dask-style task schedulers.
#[derive(Debug, Clone)]
pub struct TaskGraphAdapter {
    client: reqwest::Client,
}

impl TaskGraphAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn task_path(key: &str) -> String {
        format!("api/v1/tasks/{}", key)
    }
}

#[async_trait]
impl BackendAdapter for TaskGraphAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::TaskGraph
    }

    fn deduplicates_submissions(&self) -> bool {
        true
    }

    async fn submit(
        &self,
        request: &SubmitRequest<'_>,
        endpoint: &SchedulerEndpoint,
    ) -> AdapterResult<Submission> {
        let spec = request.spec;
        let body = TaskBody {
            key: &request.correlation_token,
            command: &spec.command,
            args: &spec.arguments,
            env: &spec.environment,
            resources: TaskResources::from(&spec.resources),
            workdir: request.workdir.path().to_string_lossy().into_owned(),
            input_files: &spec.input_files,
            output_files: &spec.output_files,
        };
        let url = endpoint_url(endpoint, "api/v1/tasks")?;
        send(authorize(self.client.post(url), endpoint).json(&body)).await?;

        info!(
            job_id = %request.job_id,
            scheduler = %endpoint.name,
            "Submitted task"
        );

        Ok(Submission::new(request.correlation_token.clone())
            .with_metadata("scheduler_address", endpoint.address.clone()))
    }

    async fn find_submission(
        &self,
        correlation_token: &str,
        endpoint: &SchedulerEndpoint,
    ) -> AdapterResult<Option<Submission>> {
        let url = endpoint_url(endpoint, &Self::task_path(correlation_token))?;
        match send(authorize(self.client.get(url), endpoint)).await {
            Ok(_) => Ok(Some(
                Submission::new(correlation_token)
                    .with_metadata("scheduler_address", endpoint.address.clone()),
            )),
            Err(AdapterError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn poll(
        &self,
        handle: &str,
        endpoint: &SchedulerEndpoint,
    ) -> AdapterResult<BackendStatus> {
        let url = endpoint_url(endpoint, &Self::task_path(handle))?;
        let info: TaskInfo = json(send(authorize(self.client.get(url), endpoint)).await?).await?;
        info.into_status()
    }

    async fn cancel(&self, handle: &str, endpoint: &SchedulerEndpoint) -> AdapterResult<()> {
        let url = endpoint_url(endpoint, &format!("{}/cancel", Self::task_path(handle)))?;
        match send(authorize(self.client.post(url), endpoint)).await {
            Ok(_) | Err(AdapterError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn release(&self, handle: &str, endpoint: &SchedulerEndpoint) -> AdapterResult<()> {
        let url = endpoint_url(endpoint, &Self::task_path(handle))?;
        match send(authorize(self.client.delete(url), endpoint)).await {
            Ok(_) | Err(AdapterError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
