//! Job manager: the facade callers use to submit and control jobs.
//!
//! The manager owns no job state of its own. Every read goes to the
//! repository and every write is a compare-and-set on the record's version,
//! so the manager, the reconciler and concurrent callers can all act on the
//! same job without locks.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backends::{
    AdapterError, AdapterRegistry, BackendAdapter, BackendStatus, SubmitRequest, Submission,
    submit_with_retry, with_timeout,
};
use crate::config::ManagerConfig;
use crate::database::repositories::{JobFilter, JobRepository};
use crate::domain::{
    ErrorKind, EventLevel, JobError, JobEvent, JobRecord, JobSpecification, JobStatus,
};
use crate::scheduler::{SchedulerEndpoint, SchedulerRegistry};
use crate::workspace::{Workspace, WorkspaceDir};
use crate::{Error, Result};

/// Result of polling one job.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// The observation was applied; the record may or may not have changed.
    Applied(JobRecord),
    /// The job had nothing to poll (terminal, or not yet submitted).
    Skipped(JobRecord),
    /// The backend could not answer; the record is untouched.
    Retryable { record: JobRecord, reason: String },
}

impl PollOutcome {
    pub fn record(&self) -> &JobRecord {
        match self {
            Self::Applied(record) | Self::Skipped(record) => record,
            Self::Retryable { record, .. } => record,
        }
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
}

impl JobStats {
    pub fn count(&self, status: JobStatus) -> u64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

/// Everything needed to talk to the backend of one job.
struct Route {
    adapter: Arc<dyn BackendAdapter>,
    endpoint: Arc<SchedulerEndpoint>,
}

/// Facade over persistence, adapters, schedulers and workspaces.
pub struct JobManager {
    repo: Arc<dyn JobRepository>,
    schedulers: Arc<SchedulerRegistry>,
    adapters: AdapterRegistry,
    workspace: Arc<dyn Workspace>,
    config: ManagerConfig,
}

impl JobManager {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        schedulers: Arc<SchedulerRegistry>,
        adapters: AdapterRegistry,
        workspace: Arc<dyn Workspace>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            repo,
            schedulers,
            adapters,
            workspace,
            config,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repo
    }

    /// Validate, persist and hand a job to its backend.
    ///
    /// Client errors (`InvalidSpecification`, `UnknownScheduler`,
    /// `CapacityExceeded`) are returned before anything is persisted. Once
    /// the record exists the caller always gets it back, SUBMITTED on
    /// success and ERROR when the backend would not take the job.
    pub async fn submit(&self, application_id: &str, spec: JobSpecification) -> Result<JobRecord> {
        if application_id.trim().is_empty() {
            return Err(Error::validation("application id must not be empty"));
        }
        spec.validate()?;
        let route = self.route_for_submit(&spec)?;
        self.check_capacity(&route.endpoint).await?;

        let mut record = JobRecord::new(application_id, spec);
        let workdir = self.workspace.resolve(application_id, record.id)?;
        record.metadata.insert(
            "workspace".to_string(),
            workdir.path().to_string_lossy().into_owned().into(),
        );

        self.repo.create_job(&record).await?;
        self.record_event(
            JobEvent::info(record.id, "Job created").with_details(json!({
                "application_id": record.application_id,
                "scheduler": record.spec.scheduler,
                "backend": record.spec.backend,
            })),
        )
        .await;
        info!(
            job_id = %record.id,
            application_id = %record.application_id,
            scheduler = %route.endpoint.name,
            "Job created"
        );

        self.dispatch(&record, &route, &workdir, false).await
    }

    /// Last persisted record.
    pub async fn get(&self, id: Uuid) -> Result<JobRecord> {
        self.repo.get_job(id).await
    }

    /// Poll one job now and persist what the backend reports.
    ///
    /// A backend that cannot answer leaves the record as it was.
    pub async fn refresh(&self, id: Uuid) -> Result<JobRecord> {
        let record = self.repo.get_job(id).await?;
        match self.poll_job(&record).await? {
            PollOutcome::Applied(record) | PollOutcome::Skipped(record) => Ok(record),
            PollOutcome::Retryable { record, reason } => {
                debug!(job_id = %id, reason = %reason, "Refresh could not reach backend");
                Ok(record)
            }
        }
    }

    /// Abort a job. Terminal jobs are returned unchanged.
    ///
    /// The record becomes ABORTED whether or not the backend confirms the
    /// cancellation.
    pub async fn cancel(&self, id: Uuid) -> Result<JobRecord> {
        let (record, aborted) = self
            .update_record(id, |rec| {
                if rec.is_terminal() {
                    return Ok(false);
                }
                rec.mark_aborted()?;
                Ok(true)
            })
            .await?;
        if !aborted {
            debug!(job_id = %id, status = %record.status, "Cancel on finished job is a no-op");
            return Ok(record);
        }

        info!(job_id = %id, "Job cancelled");
        // A PENDING job has no handle yet; the in-flight submission cancels
        // its own backend job once it sees the record is no longer PENDING.
        if let Some(handle) = record.backend_handle.as_deref() {
            self.cancel_on_backend(&record, handle).await;
        }
        Ok(record)
    }

    /// Release backend artifacts of a terminal job and delete its record.
    pub async fn cleanup(&self, id: Uuid) -> Result<()> {
        let record = self.repo.get_job(id).await?;
        if !record.is_terminal() {
            return Err(Error::invalid_state(id, record.status, "cleanup"));
        }

        if let Some(handle) = record.backend_handle.as_deref() {
            match self.route_for_record(&record) {
                Ok(route) => {
                    let released = with_timeout(
                        self.config.backend_timeout(),
                        route.adapter.release(handle, &route.endpoint),
                    )
                    .await;
                    if let Err(e) = released {
                        warn!(job_id = %id, handle, error = %e, "Failed to release backend job");
                    }
                }
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Skipping backend release");
                }
            }
        }

        self.repo.delete_job(id).await?;
        info!(job_id = %id, "Job cleaned up");
        Ok(())
    }

    /// Records matching `filter`, newest first.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        self.repo.list_jobs(filter).await
    }

    pub async fn stats(&self) -> Result<JobStats> {
        let counts = self.repo.count_by_status().await?;
        let mut stats = JobStats::default();
        for (status, count) in counts {
            stats.total += count;
            stats.by_status.insert(status.as_str().to_string(), count);
        }
        Ok(stats)
    }

    /// Event history of a job, oldest first.
    pub async fn events(&self, id: Uuid) -> Result<Vec<JobEvent>> {
        self.repo.get_job(id).await?;
        self.repo.list_events(id).await
    }

    /// Resubmit jobs left PENDING by a crash between persisting and
    /// submitting. Returns how many left PENDING.
    ///
    /// Backends that do not deduplicate are asked for an earlier submission
    /// with the job's correlation token before anything is resubmitted.
    pub async fn recover_pending(&self) -> Result<usize> {
        let pending: Vec<JobRecord> = self
            .repo
            .list_non_terminal()
            .await?
            .into_iter()
            .filter(|r| r.status == JobStatus::Pending)
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }
        info!(count = pending.len(), "Recovering pending jobs");

        let mut recovered = 0;
        for record in pending {
            let id = record.id;
            let outcome = match self.route_for_record(&record) {
                Ok(route) => match self.workspace.resolve(&record.application_id, id) {
                    Ok(workdir) => self.dispatch(&record, &route, &workdir, true).await,
                    Err(e) => {
                        let error = JobError::new(ErrorKind::SubmissionFailed, e.to_string());
                        self.fail_pending(id, error).await
                    }
                },
                Err(e) => {
                    let kind = match e {
                        Error::UnknownScheduler(_) => ErrorKind::UnknownScheduler,
                        _ => ErrorKind::SubmissionFailed,
                    };
                    self.fail_pending(id, JobError::new(kind, e.to_string())).await
                }
            };
            match outcome {
                Ok(record) if record.status != JobStatus::Pending => recovered += 1,
                Ok(_) => {}
                Err(e) => warn!(job_id = %id, error = %e, "Failed to recover pending job"),
            }
        }
        Ok(recovered)
    }

    /// Poll the backend for `record` and persist the observation.
    pub async fn poll_job(&self, record: &JobRecord) -> Result<PollOutcome> {
        let handle = match record.backend_handle.as_deref() {
            Some(handle) if !record.is_terminal() => handle,
            _ => return Ok(PollOutcome::Skipped(record.clone())),
        };

        let route = match self.route_for_record(record) {
            Ok(route) => route,
            Err(e) => {
                let kind = match e {
                    Error::UnknownScheduler(_) => ErrorKind::UnknownScheduler,
                    _ => ErrorKind::BackendFailed,
                };
                warn!(job_id = %record.id, error = %e, "Job can no longer be polled");
                let error = JobError::new(kind, e.to_string());
                return self
                    .apply_failure(record.id, handle, error)
                    .await
                    .map(PollOutcome::Applied);
            }
        };

        let polled = with_timeout(
            self.config.backend_timeout(),
            route.adapter.poll(handle, &route.endpoint),
        )
        .await;

        match polled {
            Ok(status) => self
                .apply_observation(record.id, handle, &status)
                .await
                .map(PollOutcome::Applied),
            Err(AdapterError::NotFound) => {
                let error = JobError::new(
                    ErrorKind::JobNotFound,
                    format!("backend has no job with handle {}", handle),
                );
                self.apply_failure(record.id, handle, error)
                    .await
                    .map(PollOutcome::Applied)
            }
            Err(AdapterError::Transient(reason)) | Err(AdapterError::Rejected(reason)) => {
                Ok(PollOutcome::Retryable {
                    record: record.clone(),
                    reason,
                })
            }
        }
    }

    /// Give up on a job whose backend stayed unreachable.
    pub async fn mark_unreachable(
        &self,
        id: Uuid,
        failures: u32,
        reason: &str,
    ) -> Result<JobRecord> {
        let error = JobError::new(
            ErrorKind::BackendUnreachable,
            format!("{} consecutive poll failures, last: {}", failures, reason),
        );
        let (record, changed) = self
            .update_record(id, |rec| {
                if rec.is_terminal() {
                    return Ok(false);
                }
                rec.mark_failed(error.clone())?;
                Ok(true)
            })
            .await?;
        if changed {
            warn!(job_id = %id, failures, "Job marked unreachable");
        }
        Ok(record)
    }

    fn route_for_submit(&self, spec: &JobSpecification) -> Result<Route> {
        let adapter = self.adapters.get(spec.backend).ok_or_else(|| {
            Error::validation(format!("no adapter registered for backend {}", spec.backend))
        })?;
        let endpoint = self.schedulers.resolve(&spec.scheduler)?;
        if endpoint.kind != spec.backend {
            return Err(Error::validation(format!(
                "scheduler '{}' serves {} but the job requests {}",
                endpoint.name, endpoint.kind, spec.backend
            )));
        }
        Ok(Route { adapter, endpoint })
    }

    fn route_for_record(&self, record: &JobRecord) -> Result<Route> {
        let endpoint = self.schedulers.resolve(&record.spec.scheduler)?;
        let adapter = self.adapters.get(record.spec.backend).ok_or_else(|| {
            Error::config(format!(
                "no adapter registered for backend {}",
                record.spec.backend
            ))
        })?;
        Ok(Route { adapter, endpoint })
    }

    async fn check_capacity(&self, endpoint: &SchedulerEndpoint) -> Result<()> {
        let Some(limit) = endpoint.max_concurrent_jobs else {
            return Ok(());
        };
        let active = self.repo.count_active_for_scheduler(&endpoint.name).await?;
        if active >= u64::from(limit) {
            return Err(Error::CapacityExceeded {
                scheduler: endpoint.name.clone(),
                limit,
            });
        }
        Ok(())
    }

    /// Hand a PENDING record to its backend and persist the result.
    async fn dispatch(
        &self,
        record: &JobRecord,
        route: &Route,
        workdir: &WorkspaceDir,
        recovering: bool,
    ) -> Result<JobRecord> {
        let request = SubmitRequest::new(record.id, &record.spec, workdir);
        let timeout = self.config.backend_timeout();

        let mut submitted = None;
        if recovering && !route.adapter.deduplicates_submissions() {
            let lookup = with_timeout(
                timeout,
                route
                    .adapter
                    .find_submission(&request.correlation_token, &route.endpoint),
            )
            .await;
            match lookup {
                Ok(found) => submitted = found.map(Ok),
                Err(e) => {
                    // Resubmitting blind could start the job twice.
                    warn!(
                        job_id = %record.id,
                        error = %e,
                        "Cannot check for an earlier submission"
                    );
                    return Ok(record.clone());
                }
            }
        }
        let submitted = match submitted {
            Some(found) => found,
            None => {
                submit_with_retry(route.adapter.as_ref(), &request, &route.endpoint, timeout).await
            }
        };

        match submitted {
            Ok(submission) => self.persist_submission(record.id, route, submission).await,
            Err(e) => {
                warn!(
                    job_id = %record.id,
                    scheduler = %route.endpoint.name,
                    error = %e,
                    "Submission failed"
                );
                let error = JobError::new(ErrorKind::SubmissionFailed, e.to_string());
                self.fail_pending(record.id, error).await
            }
        }
    }

    async fn persist_submission(
        &self,
        id: Uuid,
        route: &Route,
        submission: Submission,
    ) -> Result<JobRecord> {
        let Submission { handle, metadata } = submission;
        let (record, changed) = self
            .update_record(id, |rec| {
                if rec.status != JobStatus::Pending {
                    return Ok(false);
                }
                rec.mark_submitted(handle.clone(), metadata.clone())?;
                Ok(true)
            })
            .await?;

        if changed {
            info!(
                job_id = %id,
                scheduler = %route.endpoint.name,
                handle = %handle,
                "Job submitted"
            );
        } else {
            // Cancelled while the submission was in flight.
            warn!(
                job_id = %id,
                handle = %handle,
                status = %record.status,
                "Cancelling orphaned backend job"
            );
            if let Err(e) = with_timeout(
                self.config.backend_timeout(),
                route.adapter.cancel(&handle, &route.endpoint),
            )
            .await
            {
                warn!(
                    job_id = %id,
                    handle = %handle,
                    error = %e,
                    "Failed to cancel orphaned backend job"
                );
            }
        }
        Ok(record)
    }

    async fn fail_pending(&self, id: Uuid, error: JobError) -> Result<JobRecord> {
        let (record, _) = self
            .update_record(id, |rec| {
                if rec.status != JobStatus::Pending {
                    return Ok(false);
                }
                rec.mark_failed(error.clone())?;
                Ok(true)
            })
            .await?;
        Ok(record)
    }

    async fn cancel_on_backend(&self, record: &JobRecord, handle: &str) {
        let route = match self.route_for_record(record) {
            Ok(route) => route,
            Err(e) => {
                warn!(job_id = %record.id, error = %e, "Skipping backend cancel");
                return;
            }
        };
        let cancelled = with_timeout(
            self.config.backend_timeout(),
            route.adapter.cancel(handle, &route.endpoint),
        )
        .await;
        if let Err(e) = cancelled {
            warn!(job_id = %record.id, handle, error = %e, "Backend cancel failed");
        }
    }

    /// Apply a successful poll. Ignored if the record went terminal or got a
    /// different handle since it was read; status only ever moves forward.
    async fn apply_observation(
        &self,
        id: Uuid,
        handle: &str,
        status: &BackendStatus,
    ) -> Result<JobRecord> {
        let target = status.job_status();
        let metadata = status.observed_metadata();
        let (record, _) = self
            .update_record(id, |rec| {
                if rec.is_terminal() || rec.backend_handle.as_deref() != Some(handle) {
                    return Ok(false);
                }
                let metadata_changed = rec.merge_metadata(&metadata);
                if rec.status == target || !rec.status.can_transition_to(target) {
                    return Ok(metadata_changed);
                }
                match target {
                    JobStatus::Running => rec.mark_running()?,
                    JobStatus::Complete => rec.mark_complete()?,
                    JobStatus::Aborted => rec.mark_aborted()?,
                    JobStatus::Error => rec.mark_failed(status.error().unwrap_or_else(|| {
                        JobError::new(ErrorKind::BackendFailed, "backend reported failure")
                    }))?,
                    JobStatus::Pending | JobStatus::Submitted => return Ok(metadata_changed),
                }
                Ok(true)
            })
            .await?;
        Ok(record)
    }

    async fn apply_failure(&self, id: Uuid, handle: &str, error: JobError) -> Result<JobRecord> {
        let (record, _) = self
            .update_record(id, |rec| {
                if rec.is_terminal() || rec.backend_handle.as_deref() != Some(handle) {
                    return Ok(false);
                }
                rec.mark_failed(error.clone())?;
                Ok(true)
            })
            .await?;
        Ok(record)
    }

    /// Read-modify-write with compare-and-set, retried on version conflicts.
    ///
    /// `mutate` returns whether it changed the record; an unchanged record is
    /// not written. Returns the stored record and whether a write happened.
    async fn update_record<F>(&self, id: Uuid, mut mutate: F) -> Result<(JobRecord, bool)>
    where
        F: FnMut(&mut JobRecord) -> Result<bool> + Send,
    {
        let attempts = self.config.max_update_attempts.max(1);
        let mut expected = 0;
        for attempt in 1..=attempts {
            let current = self.repo.get_job(id).await?;
            let mut next = current.clone();
            if !mutate(&mut next)? {
                return Ok((current, false));
            }
            expected = current.version;
            match self.repo.compare_and_update(&next, expected).await {
                Ok(stored) => {
                    if stored.status != current.status {
                        self.record_transition(&current, &stored).await;
                    }
                    return Ok((stored, true));
                }
                Err(e) if e.is_version_conflict() => {
                    debug!(job_id = %id, attempt, "Version conflict, re-reading job");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::VersionConflict {
            id: id.to_string(),
            expected,
        })
    }

    async fn record_transition(&self, from: &JobRecord, to: &JobRecord) {
        let level = match to.status {
            JobStatus::Error => EventLevel::Error,
            JobStatus::Aborted => EventLevel::Warn,
            _ => EventLevel::Info,
        };
        let mut details = json!({
            "from": from.status,
            "to": to.status,
        });
        if let Some(handle) = &to.backend_handle {
            details["handle"] = json!(handle);
        }
        if let Some(error) = &to.last_error {
            details["error"] = json!(error);
        }
        let event = JobEvent::new(
            to.id,
            level,
            format!("Status changed from {} to {}", from.status, to.status),
        )
        .with_details(details);
        self.record_event(event).await;
    }

    async fn record_event(&self, event: JobEvent) {
        if let Err(e) = self.repo.add_event(&event).await {
            warn!(job_id = %event.job_id, error = %e, "Failed to record job event");
        }
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("schedulers", &self.schedulers.len())
            .field("adapters", &self.adapters)
            .field("config", &self.config)
            .finish()
    }
}
