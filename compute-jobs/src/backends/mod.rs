//! Backend adapters.
//!
//! Every execution technology implements [`BackendAdapter`], the capability
//! set `{submit, poll, cancel, release}`. The manager picks the adapter by
//! the specification's [`BackendKind`] through an immutable
//! [`AdapterRegistry`] built at startup.

pub mod batch_queue;
pub mod http;
pub mod local_process;
pub mod task_graph;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub use batch_queue::BatchQueueAdapter;
pub use local_process::LocalProcessAdapter;
pub use task_graph::TaskGraphAdapter;

use crate::domain::{BackendKind, ErrorKind, JobError, JobSpecification, JobStatus};
use crate::scheduler::SchedulerEndpoint;
use crate::workspace::WorkspaceDir;
use crate::{Error, Result};

/// Failure of a single adapter call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// The backend could not be reached or answered with a transient error.
    #[error("transient backend failure: {0}")]
    Transient(String),
    /// The backend has no job with this handle.
    #[error("job not found on backend")]
    NotFound,
    /// The backend refused the request.
    #[error("rejected by backend: {0}")]
    Rejected(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<AdapterError> for Error {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Transient(reason) => Error::PollRetryable(reason),
            AdapterError::NotFound => Error::not_found("backend job", "handle"),
            AdapterError::Rejected(reason) => Error::SubmissionFailed(reason),
        }
    }
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Everything an adapter needs to hand one job to its backend.
#[derive(Debug, Clone)]
pub struct SubmitRequest<'a> {
    pub job_id: Uuid,
    /// Deterministic token the backend can deduplicate submissions on.
    pub correlation_token: String,
    pub spec: &'a JobSpecification,
    pub workdir: &'a WorkspaceDir,
}

impl<'a> SubmitRequest<'a> {
    pub fn new(job_id: Uuid, spec: &'a JobSpecification, workdir: &'a WorkspaceDir) -> Self {
        Self {
            job_id,
            correlation_token: job_id.to_string(),
            spec,
            workdir,
        }
    }
}

/// A job accepted by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub handle: String,
    /// Captured at submission time so later endpoint changes do not affect
    /// the job.
    pub metadata: Map<String, Value>,
}

impl Submission {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Backend-native state, normalised across adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendState {
    Queued,
    Running,
    Held { reason: Option<String> },
    Completed { exit_code: i32 },
    Failed { reason: String },
    Removed,
}

/// Result of polling one job.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendStatus {
    pub state: BackendState,
    pub metadata: Map<String, Value>,
}

impl BackendStatus {
    pub fn new(state: BackendState) -> Self {
        Self {
            state,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Generic status this backend state maps to.
    pub fn job_status(&self) -> JobStatus {
        match &self.state {
            BackendState::Queued => JobStatus::Submitted,
            BackendState::Running | BackendState::Held { .. } => JobStatus::Running,
            BackendState::Completed { exit_code: 0 } => JobStatus::Complete,
            BackendState::Completed { .. } | BackendState::Failed { .. } => JobStatus::Error,
            BackendState::Removed => JobStatus::Aborted,
        }
    }

    /// Cause to record when the mapped status is ERROR.
    pub fn error(&self) -> Option<JobError> {
        match &self.state {
            BackendState::Completed { exit_code } if *exit_code != 0 => Some(JobError::new(
                ErrorKind::NonZeroExit,
                format!("process exited with code {}", exit_code),
            )),
            BackendState::Failed { reason } => {
                Some(JobError::new(ErrorKind::BackendFailed, reason.clone()))
            }
            _ => None,
        }
    }

    /// Adapter metadata plus the hold flag, which is surfaced here rather
    /// than as a separate status.
    pub fn observed_metadata(&self) -> Map<String, Value> {
        let mut metadata = self.metadata.clone();
        match &self.state {
            BackendState::Held { reason } => {
                metadata.insert("held".into(), Value::Bool(true));
                if let Some(reason) = reason {
                    metadata.insert("hold_reason".into(), Value::String(reason.clone()));
                }
            }
            BackendState::Running => {
                metadata.insert("held".into(), Value::Bool(false));
            }
            BackendState::Completed { exit_code } => {
                metadata.insert("exit_code".into(), Value::from(*exit_code));
            }
            _ => {}
        }
        metadata
    }
}

/// Capability set every execution backend implements.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Backend kind this adapter serves.
    fn kind(&self) -> BackendKind;

    /// Whether resubmitting with the same correlation token is deduplicated
    /// by the backend itself.
    fn deduplicates_submissions(&self) -> bool {
        false
    }

    /// Hand a job to the backend and return its handle.
    async fn submit(
        &self,
        request: &SubmitRequest<'_>,
        endpoint: &SchedulerEndpoint,
    ) -> AdapterResult<Submission>;

    /// Find an earlier submission carrying `correlation_token`.
    ///
    /// Retried submissions and startup recovery rely on this to avoid
    /// starting a job twice, so `Ok(None)` must mean the backend has no such
    /// job, not that the adapter cannot tell.
    async fn find_submission(
        &self,
        correlation_token: &str,
        endpoint: &SchedulerEndpoint,
    ) -> AdapterResult<Option<Submission>>;

    /// Current backend state of `handle`.
    async fn poll(
        &self,
        handle: &str,
        endpoint: &SchedulerEndpoint,
    ) -> AdapterResult<BackendStatus>;

    /// Best-effort cancellation; a job that is already gone counts as success.
    async fn cancel(&self, handle: &str, endpoint: &SchedulerEndpoint) -> AdapterResult<()>;

    /// Best-effort removal of backend-side bookkeeping for a finished job.
    async fn release(&self, handle: &str, endpoint: &SchedulerEndpoint) -> AdapterResult<()>;
}

/// Bound an adapter call; elapsing counts as a transient failure.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> AdapterResult<T>
where
    F: Future<Output = AdapterResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Transient(format!(
            "backend call timed out after {:?}",
            limit
        ))),
    }
}

/// Submit with exactly one retry on transient failure.
///
/// Unless the backend deduplicates on the correlation token, the retry only
/// happens after confirming the first attempt left no job behind.
pub async fn submit_with_retry(
    adapter: &dyn BackendAdapter,
    request: &SubmitRequest<'_>,
    endpoint: &SchedulerEndpoint,
    call_timeout: Duration,
) -> AdapterResult<Submission> {
    let first = match with_timeout(call_timeout, adapter.submit(request, endpoint)).await {
        Err(AdapterError::Transient(reason)) => reason,
        other => return other,
    };

    warn!(
        job_id = %request.job_id,
        scheduler = %endpoint.name,
        error = %first,
        "Submission failed transiently, retrying once"
    );

    if !adapter.deduplicates_submissions() {
        let lookup = with_timeout(
            call_timeout,
            adapter.find_submission(&request.correlation_token, endpoint),
        )
        .await;
        match lookup {
            Ok(Some(existing)) => {
                debug!(
                    job_id = %request.job_id,
                    handle = %existing.handle,
                    "Found submission from the failed attempt"
                );
                return Ok(existing);
            }
            Ok(None) => {}
            Err(e) => {
                return Err(AdapterError::Transient(format!(
                    "{first}; could not verify absence of a prior submission: {e}"
                )));
            }
        }
    }

    with_timeout(call_timeout, adapter.submit(request, endpoint)).await
}

/// Immutable backend kind → adapter lookup.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<BackendKind, Arc<dyn BackendAdapter>>,
}

impl AdapterRegistry {
    pub fn new(adapters: impl IntoIterator<Item = Arc<dyn BackendAdapter>>) -> Result<Self> {
        let mut map: HashMap<BackendKind, Arc<dyn BackendAdapter>> = HashMap::new();
        for adapter in adapters {
            let kind = adapter.kind();
            if map.insert(kind, adapter).is_some() {
                return Err(Error::config(format!(
                    "more than one adapter registered for {}",
                    kind
                )));
            }
        }
        Ok(Self { adapters: map })
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = BackendKind> + '_ {
        self.adapters.keys().copied()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("kinds", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}
