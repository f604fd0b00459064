//! Background status reconciler.
//!
//! Sweeps every non-terminal job on a fixed interval, polls its backend and
//! persists what it sees through the manager. Sweeps never overlap; within a
//! sweep at most `max_concurrent_polls` polls are in flight.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::Result;
use crate::config::ReconcilerConfig;
use crate::domain::{JobRecord, JobStatus};
use crate::manager::{JobManager, PollOutcome};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Jobs whose backend was asked for status.
    pub polled: usize,
    /// Jobs whose status changed.
    pub transitioned: usize,
    /// Polls that failed retryably and stayed under the ceiling.
    pub retryable: usize,
    /// Jobs marked ERROR after reaching the failure ceiling.
    pub unreachable: usize,
    /// Polls that failed with a non-backend error.
    pub errors: usize,
}

/// Periodically reconciles persisted job status with the backends.
pub struct StatusReconciler {
    manager: Arc<JobManager>,
    config: ReconcilerConfig,
    /// Consecutive retryable failures per job. Lost on restart.
    failures: DashMap<Uuid, u32>,
    semaphore: Arc<Semaphore>,
    sweep_lock: tokio::sync::Mutex<()>,
    /// The background loop and the token that stops it; `None` when stopped.
    task: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl StatusReconciler {
    pub fn new(manager: Arc<JobManager>, config: ReconcilerConfig) -> Self {
        Self {
            manager,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_polls.max(1))),
            config,
            failures: DashMap::new(),
            sweep_lock: tokio::sync::Mutex::new(()),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Current consecutive failure count of a job.
    pub fn failure_count(&self, id: Uuid) -> u32 {
        self.failures.get(&id).map(|c| *c).unwrap_or(0)
    }

    /// Poll every non-terminal job once.
    pub async fn run_sweep(&self) -> Result<SweepReport> {
        let _sweep = self.sweep_lock.lock().await;
        let mut report = SweepReport::default();

        let records: Vec<JobRecord> = self
            .manager
            .repository()
            .list_non_terminal()
            .await?
            .into_iter()
            // PENDING jobs are still being submitted, or wait for recovery.
            .filter(|r| r.status != JobStatus::Pending)
            .collect();

        let active: HashSet<Uuid> = records.iter().map(|r| r.id).collect();
        self.failures.retain(|id, _| active.contains(id));

        let mut join_set = JoinSet::new();
        for record in records {
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let manager = self.manager.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let outcome = manager.poll_job(&record).await;
                (record, outcome)
            });
            report.polled += 1;
        }

        while let Some(joined) = join_set.join_next().await {
            let (before, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Poll task panicked");
                    report.errors += 1;
                    continue;
                }
            };
            self.handle_outcome(&before, outcome, &mut report).await;
        }

        if report.transitioned > 0 || report.unreachable > 0 {
            info!(
                polled = report.polled,
                transitioned = report.transitioned,
                retryable = report.retryable,
                unreachable = report.unreachable,
                "Sweep finished"
            );
        } else {
            debug!(polled = report.polled, retryable = report.retryable, "Sweep finished");
        }
        Ok(report)
    }

    async fn handle_outcome(
        &self,
        before: &JobRecord,
        outcome: Result<PollOutcome>,
        report: &mut SweepReport,
    ) {
        let id = before.id;
        match outcome {
            Ok(PollOutcome::Applied(record)) => {
                self.failures.remove(&id);
                if record.status != before.status {
                    debug!(
                        job_id = %id,
                        from = %before.status,
                        to = %record.status,
                        "Job advanced"
                    );
                    if let Some(err) = record.failure() {
                        warn!(job_id = %id, error = %err, "Job failed");
                    }
                    report.transitioned += 1;
                }
            }
            Ok(PollOutcome::Skipped(_)) => {
                self.failures.remove(&id);
            }
            Ok(PollOutcome::Retryable { reason, .. }) => {
                let failures = {
                    let mut count = self.failures.entry(id).or_insert(0);
                    *count += 1;
                    *count
                };
                if failures < self.config.failure_ceiling {
                    debug!(job_id = %id, failures, reason = %reason, "Poll failed, will retry");
                    report.retryable += 1;
                    return;
                }
                self.failures.remove(&id);
                match self.manager.mark_unreachable(id, failures, &reason).await {
                    Ok(record) if record.status == JobStatus::Error => report.unreachable += 1,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(job_id = %id, error = %e, "Failed to mark job unreachable");
                        report.errors += 1;
                    }
                }
            }
            Err(e) if e.is_not_found() => {
                // Cleaned up mid-sweep.
                self.failures.remove(&id);
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "Failed to reconcile job");
                report.errors += 1;
            }
        }
    }

    /// Start sweeping in the background. The first sweep runs immediately.
    ///
    /// A stopped reconciler can be started again.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("Status reconciler already started");
            return;
        }

        info!(
            interval_ms = self.config.poll_interval_ms,
            max_concurrent_polls = self.config.max_concurrent_polls,
            failure_ceiling = self.config.failure_ceiling,
            "Starting status reconciler"
        );

        let this = self.clone();
        let cancellation_token = CancellationToken::new();
        let loop_token = cancellation_token.clone();
        let interval = self.config.poll_interval();
        let handle = tokio::spawn(async move {
            loop {
                if loop_token.is_cancelled() {
                    break;
                }
                if let Err(e) = this.run_sweep().await {
                    error!(error = %e, "Sweep failed");
                }
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("Status reconciler loop exited");
        });
        *task = Some((cancellation_token, handle));
    }

    /// Stop sweeping and wait for the current sweep to finish.
    pub async fn stop(&self) {
        let Some((cancellation_token, handle)) = self.task.lock().take() else {
            return;
        };
        info!("Stopping status reconciler");
        cancellation_token.cancel();
        if let Err(e) = handle.await {
            error!(error = %e, "Status reconciler task failed");
        }
        info!("Status reconciler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

impl std::fmt::Debug for StatusReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReconciler")
            .field("config", &self.config)
            .field("tracked_failures", &self.failures.len())
            .finish()
    }
}
