//! Batch queue adapter for HTCondor-style schedulers.
//!
//! Talks to the scheduler's REST front end. One job is one queue entry and
//! the handle is the entry id (`cluster.proc`). Submissions carry the job id
//! as `correlation_id`, which the queue stores on the entry so a retry can
//! look it up instead of queueing a duplicate.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::http::{authorize, endpoint_url, json, send};
use super::{
    AdapterError, AdapterResult, BackendAdapter, BackendState, BackendStatus, SubmitRequest,
    Submission,
};
use crate::domain::{BackendKind, FileTransfer};
use crate::scheduler::SchedulerEndpoint;

/// HTCondor `JobStatus` codes.
mod job_status {
    pub const IDLE: i32 = 1;
    pub const RUNNING: i32 = 2;
    pub const REMOVED: i32 = 3;
    pub const COMPLETED: i32 = 4;
    pub const HELD: i32 = 5;
    pub const TRANSFERRING_OUTPUT: i32 = 6;
    pub const SUSPENDED: i32 = 7;
}

#[derive(Debug, Serialize)]
struct SubmitBody<'a> {
    correlation_id: &'a str,
    executable: &'a str,
    arguments: &'a [String],
    environment: &'a BTreeMap<String, String>,
    initialdir: String,
    request_cpus: u32,
    request_memory: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_gpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue: Option<&'a str>,
    transfer_input_files: &'a [FileTransfer],
    transfer_output_files: &'a [FileTransfer],
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

/// The subset of a job ClassAd the adapter reads.
#[derive(Debug, Clone, Deserialize)]
struct JobAd {
    id: String,
    job_status: i32,
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    exit_by_signal: Option<bool>,
    #[serde(default)]
    exit_signal: Option<i32>,
    #[serde(default)]
    hold_reason: Option<String>,
    #[serde(default)]
    remote_host: Option<String>,
}

impl JobAd {
    fn into_status(self) -> AdapterResult<BackendStatus> {
        let state = match self.job_status {
            job_status::IDLE => BackendState::Queued,
            job_status::RUNNING | job_status::TRANSFERRING_OUTPUT => BackendState::Running,
            job_status::HELD => BackendState::Held {
                reason: self.hold_reason.clone(),
            },
            job_status::SUSPENDED => BackendState::Held {
                reason: Some("suspended".to_string()),
            },
            job_status::REMOVED => BackendState::Removed,
            job_status::COMPLETED => match (self.exit_by_signal, self.exit_code) {
                (Some(true), _) => BackendState::Failed {
                    reason: format!(
                        "killed by signal {}",
                        self.exit_signal
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "unknown".into())
                    ),
                },
                (_, Some(exit_code)) => BackendState::Completed { exit_code },
                (_, None) => BackendState::Failed {
                    reason: "completed without an exit code".to_string(),
                },
            },
            other => {
                return Err(AdapterError::Transient(format!(
                    "queue entry {} reports unknown JobStatus {}",
                    self.id, other
                )));
            }
        };

        let mut status =
            BackendStatus::new(state).with_metadata("job_status_code", self.job_status);
        if let Some(host) = self.remote_host {
            status = status.with_metadata("remote_host", host);
        }
        Ok(status)
    }
}

#[derive(Debug, Serialize)]
struct RemoveBody<'a> {
    reason: &'a str,
}

/// Adapter for HTCondor-style batch queues.
#[derive(Debug, Clone)]
pub struct BatchQueueAdapter {
    client: reqwest::Client,
}

impl BatchQueueAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BackendAdapter for BatchQueueAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::BatchQueue
    }

    async fn submit(
        &self,
        request: &SubmitRequest<'_>,
        endpoint: &SchedulerEndpoint,
    ) -> AdapterResult<Submission> {
        let spec = request.spec;
        let queue = endpoint.default_queue.as_deref();
        let body = SubmitBody {
            correlation_id: &request.correlation_token,
            executable: &spec.command,
            arguments: &spec.arguments,
            environment: &spec.environment,
            initialdir: request.workdir.path().to_string_lossy().into_owned(),
            request_cpus: spec.resources.cpus,
            request_memory: spec.resources.memory_mb,
            request_gpus: spec.resources.gpus,
            queue,
            transfer_input_files: &spec.input_files,
            transfer_output_files: &spec.output_files,
        };

        let url = endpoint_url(endpoint, "v1/jobs")?;
        let response = send(authorize(self.client.post(url), endpoint).json(&body)).await?;
        let SubmitResponse { id } = json(response).await?;
        if id.is_empty() {
            return Err(AdapterError::Rejected("queue returned an empty job id".into()));
        }

        info!(
            job_id = %request.job_id,
            scheduler = %endpoint.name,
            handle = %id,
            "Queued batch job"
        );

        let mut submission = Submission::new(id)
            .with_metadata("scheduler_address", endpoint.address.clone())
            .with_metadata("correlation_id", request.correlation_token.clone());
        if let Some(queue) = queue {
            submission = submission.with_metadata("queue", queue);
        }
        Ok(submission)
    }

    async fn find_submission(
        &self,
        correlation_token: &str,
        endpoint: &SchedulerEndpoint,
    ) -> AdapterResult<Option<Submission>> {
        let url = endpoint_url(endpoint, "v1/jobs")?;
        let request = authorize(self.client.get(url), endpoint)
            .query(&[("correlation_id", correlation_token)]);
        let ads: Vec<JobAd> = json(send(request).await?).await?;
        Ok(ads.into_iter().next().map(|ad| {
            debug!(handle = %ad.id, correlation_id = correlation_token, "Found queue entry");
            Submission::new(ad.id)
                .with_metadata("scheduler_address", endpoint.address.clone())
                .with_metadata("correlation_id", correlation_token)
        }))
    }

    async fn poll(
        &self,
        handle: &str,
        endpoint: &SchedulerEndpoint,
    ) -> AdapterResult<BackendStatus> {
        let url = endpoint_url(endpoint, &format!("v1/jobs/{}", handle))?;
        let ad: JobAd = json(send(authorize(self.client.get(url), endpoint)).await?).await?;
        ad.into_status()
    }

    async fn cancel(&self, handle: &str, endpoint: &SchedulerEndpoint) -> AdapterResult<()> {
        let url = endpoint_url(endpoint, &format!("v1/jobs/{}/remove", handle))?;
        let body = RemoveBody {
            reason: "cancelled by compute-jobs",
        };
        match send(authorize(self.client.post(url), endpoint).json(&body)).await {
            Ok(_) | Err(AdapterError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn release(&self, handle: &str, endpoint: &SchedulerEndpoint) -> AdapterResult<()> {
        let url = endpoint_url(endpoint, &format!("v1/jobs/{}", handle))?;
        match send(authorize(self.client.delete(url), endpoint)).await {
            Ok(_) | Err(AdapterError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
