//! End-to-end behaviour of the job manager and the status reconciler.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tempfile::TempDir;

use compute_jobs::backends::{
    AdapterError, AdapterRegistry, AdapterResult, BackendAdapter, BackendState, BackendStatus,
    LocalProcessAdapter, SubmitRequest, Submission,
};
use compute_jobs::config::{ManagerConfig, ReconcilerConfig};
use compute_jobs::database::repositories::{InMemoryJobRepository, JobFilter, JobRepository};
use compute_jobs::domain::{BackendKind, ErrorKind, JobRecord, JobSpecification, JobStatus};
use compute_jobs::scheduler::{SchedulerEndpoint, SchedulerRegistry};
use compute_jobs::workspace::LocalWorkspace;
use compute_jobs::{Error, JobManager, StatusReconciler};

/// Batch-queue stand-in whose answers the test controls.
struct ScriptedAdapter {
    submit_error: Mutex<Option<AdapterError>>,
    existing: Mutex<Option<String>>,
    poll_result: Mutex<AdapterResult<BackendStatus>>,
    release_error: Mutex<Option<AdapterError>>,
    submits: AtomicUsize,
    polls: AtomicUsize,
    cancels: AtomicUsize,
    releases: AtomicUsize,
}

impl ScriptedAdapter {
    fn new() -> Self {
        Self {
            submit_error: Mutex::new(None),
            existing: Mutex::new(None),
            poll_result: Mutex::new(Ok(BackendStatus::new(BackendState::Queued))),
            release_error: Mutex::new(None),
            submits: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    fn set_poll(&self, result: AdapterResult<BackendStatus>) {
        *self.poll_result.lock() = result;
    }

    fn set_state(&self, state: BackendState) {
        self.set_poll(Ok(BackendStatus::new(state)));
    }
}

#[async_trait]
impl BackendAdapter for ScriptedAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::BatchQueue
    }

    async fn submit(
        &self,
        _request: &SubmitRequest<'_>,
        endpoint: &SchedulerEndpoint,
    ) -> AdapterResult<Submission> {
        if let Some(err) = self.submit_error.lock().clone() {
            return Err(err);
        }
        let n = self.submits.fetch_add(1, Ordering::SeqCst);
        Ok(Submission::new(format!("{}.0", n + 1))
            .with_metadata("scheduler_address", endpoint.address.clone()))
    }

    async fn find_submission(
        &self,
        _correlation_token: &str,
        _endpoint: &SchedulerEndpoint,
    ) -> AdapterResult<Option<Submission>> {
        Ok(self.existing.lock().clone().map(Submission::new))
    }

    async fn poll(
        &self,
        _handle: &str,
        _endpoint: &SchedulerEndpoint,
    ) -> AdapterResult<BackendStatus> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.poll_result.lock().clone()
    }

    async fn cancel(&self, _handle: &str, _endpoint: &SchedulerEndpoint) -> AdapterResult<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self, _handle: &str, _endpoint: &SchedulerEndpoint) -> AdapterResult<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        match self.release_error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct Harness {
    manager: Arc<JobManager>,
    reconciler: Arc<StatusReconciler>,
    adapter: Arc<ScriptedAdapter>,
    repo: Arc<InMemoryJobRepository>,
    _workspace: TempDir,
}

fn harness() -> Harness {
    harness_with(ReconcilerConfig {
        poll_interval_ms: 50,
        max_concurrent_polls: 4,
        failure_ceiling: 5,
    })
}

fn harness_with(reconciler_config: ReconcilerConfig) -> Harness {
    let workspace = tempfile::tempdir().unwrap();
    let repo = Arc::new(InMemoryJobRepository::new());
    let adapter = Arc::new(ScriptedAdapter::new());

    let schedulers = SchedulerRegistry::new([
        SchedulerEndpoint::new("condor", BackendKind::BatchQueue, "http://condor.test"),
        SchedulerEndpoint::new("small", BackendKind::BatchQueue, "http://small.test")
            .with_max_concurrent_jobs(1),
        SchedulerEndpoint::new("local", BackendKind::LocalProcess, "localhost"),
    ])
    .unwrap();
    let adapters: Vec<Arc<dyn BackendAdapter>> =
        vec![adapter.clone(), Arc::new(LocalProcessAdapter::new())];

    let manager = Arc::new(JobManager::new(
        repo.clone(),
        Arc::new(schedulers),
        AdapterRegistry::new(adapters).unwrap(),
        Arc::new(LocalWorkspace::new(workspace.path())),
        ManagerConfig {
            backend_timeout_ms: 2_000,
            max_update_attempts: 8,
        },
    ));
    let reconciler = Arc::new(StatusReconciler::new(manager.clone(), reconciler_config));

    Harness {
        manager,
        reconciler,
        adapter,
        repo,
        _workspace: workspace,
    }
}

fn batch(scheduler: &str) -> JobSpecification {
    JobSpecification::new(BackendKind::BatchQueue, "/opt/sim/bin/run", scheduler)
        .with_args(["--input", "model.inp"])
}

fn shell(script: &str) -> JobSpecification {
    JobSpecification::new(BackendKind::LocalProcess, "sh", "local").with_args(["-c", script])
}

async fn sweep_until_terminal(h: &Harness, id: uuid::Uuid) -> JobRecord {
    for _ in 0..200 {
        h.reconciler.run_sweep().await.unwrap();
        let rec = h.manager.get(id).await.unwrap();
        if rec.is_terminal() {
            return rec;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {id} never reached a terminal status");
}

#[tokio::test]
async fn test_submit_persists_submitted_record() {
    let h = harness();
    let rec = h.manager.submit("chem", batch("condor")).await.unwrap();

    assert_eq!(rec.status, JobStatus::Submitted);
    assert_eq!(rec.backend_handle.as_deref(), Some("1.0"));
    assert!(rec.submitted_at.is_some());
    assert_eq!(
        rec.metadata.get("scheduler_address"),
        Some(&Value::from("http://condor.test"))
    );
    assert!(rec.metadata.contains_key("workspace"));

    let stored = h.manager.get(rec.id).await.unwrap();
    assert_eq!(stored, rec);
    stored.check_invariants().unwrap();

    let events = h.manager.events(rec.id).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].message, "Job created");
    assert!(events[1].message.contains("SUBMITTED"));
}

#[tokio::test]
async fn test_unknown_scheduler_persists_nothing() {
    let h = harness();
    let err = h.manager.submit("chem", batch("hpc1")).await.unwrap_err();
    assert!(matches!(err, Error::UnknownScheduler(ref name) if name == "hpc1"));
    assert!(h.repo.is_empty());
    assert_eq!(h.adapter.submits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_specifications_are_rejected_up_front() {
    let h = harness();

    let empty = JobSpecification::new(BackendKind::BatchQueue, "  ", "condor");
    assert!(matches!(
        h.manager.submit("chem", empty).await,
        Err(Error::InvalidSpecification(_))
    ));

    // Local job pointed at a batch scheduler.
    let mismatched = JobSpecification::new(BackendKind::LocalProcess, "true", "condor");
    assert!(matches!(
        h.manager.submit("chem", mismatched).await,
        Err(Error::InvalidSpecification(_))
    ));

    // No adapter for task graphs in this harness.
    let unsupported = JobSpecification::new(BackendKind::TaskGraph, "run", "condor");
    assert!(matches!(
        h.manager.submit("chem", unsupported).await,
        Err(Error::InvalidSpecification(_))
    ));

    assert!(matches!(
        h.manager.submit("../escape", batch("condor")).await,
        Err(Error::InvalidSpecification(_))
    ));

    assert!(h.repo.is_empty());
}

#[tokio::test]
async fn test_submission_failure_is_recorded() {
    let h = harness();
    *h.adapter.submit_error.lock() = Some(AdapterError::Rejected("queue disabled".into()));

    let rec = h.manager.submit("chem", batch("condor")).await.unwrap();
    assert_eq!(rec.status, JobStatus::Error);
    assert!(rec.backend_handle.is_none());
    assert!(rec.completed_at.is_some());
    let err = rec.last_error.unwrap();
    assert_eq!(err.kind, ErrorKind::SubmissionFailed);
    assert!(err.message.contains("queue disabled"));
}

#[tokio::test]
async fn test_transient_submission_failure_retries_once() {
    let h = harness();
    *h.adapter.submit_error.lock() = Some(AdapterError::Transient("503".into()));

    let rec = h.manager.submit("chem", batch("condor")).await.unwrap();
    assert_eq!(rec.status, JobStatus::Error);
    assert_eq!(rec.last_error.unwrap().kind, ErrorKind::SubmissionFailed);

    // The lookup before the retry finds the first attempt's entry.
    *h.adapter.existing.lock() = Some("41.0".into());
    let rec = h.manager.submit("chem", batch("condor")).await.unwrap();
    assert_eq!(rec.status, JobStatus::Submitted);
    assert_eq!(rec.backend_handle.as_deref(), Some("41.0"));
}

#[tokio::test]
async fn test_capacity_ceiling() {
    let h = harness();
    h.manager.submit("chem", batch("small")).await.unwrap();

    let err = h.manager.submit("chem", batch("small")).await.unwrap_err();
    assert!(matches!(err, Error::CapacityExceeded { limit: 1, .. }));
    assert_eq!(h.repo.len(), 1);

    // Other endpoints are unaffected.
    h.manager.submit("chem", batch("condor")).await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_process_exit_zero_completes() {
    let h = harness();
    let rec = h.manager.submit("chem", shell("exit 0")).await.unwrap();
    assert_eq!(rec.status, JobStatus::Submitted);

    let done = sweep_until_terminal(&h, rec.id).await;
    assert_eq!(done.status, JobStatus::Complete);
    assert!(done.completed_at.is_some());
    assert!(done.last_error.is_none());
    assert_eq!(done.metadata.get("exit_code"), Some(&Value::from(0)));
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_process_exit_one_errors() {
    let h = harness();
    let rec = h.manager.submit("chem", shell("exit 1")).await.unwrap();

    let done = sweep_until_terminal(&h, rec.id).await;
    assert_eq!(done.status, JobStatus::Error);
    let err = done.last_error.unwrap();
    assert_eq!(err.kind, ErrorKind::NonZeroExit);
    assert!(err.message.contains("code 1"));
}

#[tokio::test]
async fn test_cancel_before_first_sweep_sticks() {
    let h = harness();
    let rec = h.manager.submit("chem", batch("condor")).await.unwrap();

    let cancelled = h.manager.cancel(rec.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Aborted);
    assert!(cancelled.completed_at.is_some());
    assert_eq!(h.adapter.cancels.load(Ordering::SeqCst), 1);

    // The backend still claims the job runs; the sweep must not revive it.
    h.adapter.set_state(BackendState::Running);
    let report = h.reconciler.run_sweep().await.unwrap();
    assert_eq!(report.polled, 0);
    assert_eq!(h.manager.get(rec.id).await.unwrap().status, JobStatus::Aborted);
    assert_eq!(h.manager.refresh(rec.id).await.unwrap().status, JobStatus::Aborted);
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let h = harness();
    let rec = h.manager.submit("chem", batch("condor")).await.unwrap();

    let first = h.manager.cancel(rec.id).await.unwrap();
    let second = h.manager.cancel(rec.id).await.unwrap();
    assert_eq!(first.status, JobStatus::Aborted);
    assert_eq!(second.status, JobStatus::Aborted);
    assert_eq!(first.version, second.version);
    assert_eq!(h.adapter.cancels.load(Ordering::SeqCst), 1);

    let missing = h.manager.cancel(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(missing.is_not_found());
}

#[tokio::test]
async fn test_unreachable_after_failure_ceiling() {
    let h = harness();
    let rec = h.manager.submit("chem", batch("condor")).await.unwrap();
    h.adapter
        .set_poll(Err(AdapterError::Transient("connection refused".into())));

    for n in 1..=4 {
        let report = h.reconciler.run_sweep().await.unwrap();
        assert_eq!(report.retryable, 1);
        assert_eq!(h.reconciler.failure_count(rec.id), n);
        let current = h.manager.get(rec.id).await.unwrap();
        assert_eq!(current.status, JobStatus::Submitted, "gave up after {n} failures");
    }

    let report = h.reconciler.run_sweep().await.unwrap();
    assert_eq!(report.unreachable, 1);
    let rec = h.manager.get(rec.id).await.unwrap();
    assert_eq!(rec.status, JobStatus::Error);
    let err = rec.last_error.unwrap();
    assert_eq!(err.kind, ErrorKind::BackendUnreachable);
    assert!(err.message.contains("connection refused"));
    assert_eq!(h.reconciler.failure_count(rec.id), 0);
}

#[tokio::test]
async fn test_successful_poll_resets_failures() {
    let h = harness();
    let rec = h.manager.submit("chem", batch("condor")).await.unwrap();

    h.adapter.set_poll(Err(AdapterError::Transient("timeout".into())));
    for _ in 0..4 {
        h.reconciler.run_sweep().await.unwrap();
    }
    assert_eq!(h.reconciler.failure_count(rec.id), 4);

    h.adapter.set_state(BackendState::Running);
    h.reconciler.run_sweep().await.unwrap();
    assert_eq!(h.reconciler.failure_count(rec.id), 0);

    h.adapter.set_poll(Err(AdapterError::Transient("timeout".into())));
    h.reconciler.run_sweep().await.unwrap();
    assert_eq!(h.manager.get(rec.id).await.unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn test_status_never_moves_backwards() {
    let h = harness();
    let rec = h.manager.submit("chem", batch("condor")).await.unwrap();

    h.adapter.set_state(BackendState::Running);
    let running = h.manager.refresh(rec.id).await.unwrap();
    assert_eq!(running.status, JobStatus::Running);

    h.adapter.set_state(BackendState::Queued);
    let still = h.manager.refresh(rec.id).await.unwrap();
    assert_eq!(still.status, JobStatus::Running);
}

#[tokio::test]
async fn test_held_job_is_running_with_flag() {
    let h = harness();
    let rec = h.manager.submit("chem", batch("condor")).await.unwrap();

    h.adapter.set_state(BackendState::Held {
        reason: Some("disk quota exceeded".into()),
    });
    let held = h.manager.refresh(rec.id).await.unwrap();
    assert_eq!(held.status, JobStatus::Running);
    assert_eq!(held.metadata.get("held"), Some(&Value::Bool(true)));
    assert_eq!(
        held.metadata.get("hold_reason"),
        Some(&Value::from("disk quota exceeded"))
    );

    h.adapter.set_state(BackendState::Running);
    let released = h.manager.refresh(rec.id).await.unwrap();
    assert_eq!(released.metadata.get("held"), Some(&Value::Bool(false)));
}

#[tokio::test]
async fn test_vanished_job_is_recorded_as_not_found() {
    let h = harness();
    let rec = h.manager.submit("chem", batch("condor")).await.unwrap();

    h.adapter.set_poll(Err(AdapterError::NotFound));
    let rec = h.manager.refresh(rec.id).await.unwrap();
    assert_eq!(rec.status, JobStatus::Error);
    assert_eq!(rec.last_error.unwrap().kind, ErrorKind::JobNotFound);
}

#[tokio::test]
async fn test_refresh_with_unreachable_backend_leaves_record() {
    let h = harness();
    let rec = h.manager.submit("chem", batch("condor")).await.unwrap();

    h.adapter.set_poll(Err(AdapterError::Transient("503".into())));
    let refreshed = h.manager.refresh(rec.id).await.unwrap();
    assert_eq!(refreshed, rec);
}

#[tokio::test]
async fn test_cleanup_lifecycle() {
    let h = harness();
    let rec = h.manager.submit("chem", batch("condor")).await.unwrap();

    let err = h.manager.cleanup(rec.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(h.manager.get(rec.id).await.unwrap(), rec);

    h.adapter.set_state(BackendState::Completed { exit_code: 0 });
    let done = h.manager.refresh(rec.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Complete);

    // Release failures do not block cleanup.
    *h.adapter.release_error.lock() = Some(AdapterError::Transient("down".into()));
    h.manager.cleanup(rec.id).await.unwrap();
    assert_eq!(h.adapter.releases.load(Ordering::SeqCst), 1);

    assert!(h.manager.get(rec.id).await.unwrap_err().is_not_found());
    assert!(h.manager.cleanup(rec.id).await.unwrap_err().is_not_found());
    assert!(h.repo.list_events(rec.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cleanup_rejects_pending() {
    let h = harness();
    let pending = JobRecord::new("chem", batch("condor"));
    h.repo.create_job(&pending).await.unwrap();

    let err = h.manager.cleanup(pending.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(h.manager.get(pending.id).await.unwrap(), pending);
}

#[tokio::test]
async fn test_concurrent_refresh_and_sweep_keep_invariants() {
    let h = harness();
    let mut ids = Vec::new();
    for _ in 0..12 {
        ids.push(h.manager.submit("chem", batch("condor")).await.unwrap().id);
    }
    h.adapter.set_state(BackendState::Running);

    let refreshes = futures::future::join_all(ids.iter().map(|id| h.manager.refresh(*id)));
    let (refreshed, sweep) = tokio::join!(refreshes, h.reconciler.run_sweep());
    sweep.unwrap();
    for result in refreshed {
        result.unwrap().check_invariants().unwrap();
    }

    h.adapter.set_state(BackendState::Completed { exit_code: 0 });
    let refreshes = futures::future::join_all(ids.iter().map(|id| h.manager.refresh(*id)));
    let (refreshed, sweep) = tokio::join!(refreshes, h.reconciler.run_sweep());
    sweep.unwrap();
    for result in refreshed {
        result.unwrap();
    }

    for id in ids {
        let rec = h.manager.get(id).await.unwrap();
        rec.check_invariants().unwrap();
        assert_eq!(rec.status, JobStatus::Complete);
        assert!(rec.backend_handle.is_some());
        let transitions = h
            .manager
            .events(id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.message.contains("to COMPLETE"))
            .count();
        assert_eq!(transitions, 1, "job {id} completed more than once");
    }
}

#[tokio::test]
async fn test_recover_pending_reuses_earlier_submission() {
    let h = harness();
    let orphan = JobRecord::new("chem", batch("condor"));
    h.repo.create_job(&orphan).await.unwrap();
    let fresh = JobRecord::new("chem", batch("condor"));
    h.repo.create_job(&fresh).await.unwrap();

    // Only the lookup is scripted, so both jobs resolve to the same entry.
    *h.adapter.existing.lock() = Some("99.0".into());
    assert_eq!(h.manager.recover_pending().await.unwrap(), 2);
    assert_eq!(h.adapter.submits.load(Ordering::SeqCst), 0);

    let rec = h.manager.get(orphan.id).await.unwrap();
    assert_eq!(rec.status, JobStatus::Submitted);
    assert_eq!(rec.backend_handle.as_deref(), Some("99.0"));

    assert_eq!(h.manager.recover_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn test_recover_pending_resubmits_or_fails() {
    let h = harness();
    let resubmit = JobRecord::new("chem", batch("condor"));
    h.repo.create_job(&resubmit).await.unwrap();
    let stale = JobRecord::new("chem", batch("retired-cluster"));
    h.repo.create_job(&stale).await.unwrap();

    assert_eq!(h.manager.recover_pending().await.unwrap(), 2);
    assert_eq!(h.adapter.submits.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.manager.get(resubmit.id).await.unwrap().status,
        JobStatus::Submitted
    );

    let failed = h.manager.get(stale.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Error);
    assert_eq!(failed.last_error.unwrap().kind, ErrorKind::UnknownScheduler);
}

#[tokio::test]
async fn test_list_and_stats() {
    let h = harness();
    let a = h.manager.submit("chem", batch("condor")).await.unwrap();
    h.manager.submit("bio", batch("condor")).await.unwrap();
    h.manager.cancel(a.id).await.unwrap();

    let chem = h
        .manager
        .list(&JobFilter {
            application_id: Some("chem".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(chem.len(), 1);
    assert_eq!(chem[0].id, a.id);

    let stats = h.manager.stats().await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.count(JobStatus::Aborted), 1);
    assert_eq!(stats.count(JobStatus::Submitted), 1);
    assert_eq!(stats.count(JobStatus::Complete), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_background_reconciler_advances_jobs() {
    let h = harness();
    let rec = h.manager.submit("chem", shell("exit 0")).await.unwrap();

    h.reconciler.start();
    assert!(h.reconciler.is_running());

    let mut status = rec.status;
    for _ in 0..200 {
        status = h.manager.get(rec.id).await.unwrap().status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    h.reconciler.stop().await;

    assert_eq!(status, JobStatus::Complete);
    assert!(!h.reconciler.is_running());
}

#[cfg(unix)]
#[tokio::test]
async fn test_reconciler_restarts_after_stop() {
    let h = harness();
    h.reconciler.start();
    h.reconciler.stop().await;
    assert!(!h.reconciler.is_running());
    // Stopping twice is harmless.
    h.reconciler.stop().await;

    let rec = h.manager.submit("chem", shell("exit 0")).await.unwrap();
    h.reconciler.start();
    assert!(h.reconciler.is_running());

    let mut status = rec.status;
    for _ in 0..200 {
        status = h.manager.get(rec.id).await.unwrap().status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    h.reconciler.stop().await;

    assert_eq!(status, JobStatus::Complete);
}
