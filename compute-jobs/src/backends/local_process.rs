//! Local process adapter.
//!
//! Each job is a child process of the daemon. The handle is the pid; a
//! watcher task per child reaps it, copies declared outputs to their remote
//! location after a clean exit and records the outcome, so polling never
//! blocks on the process. Children survive a daemon restart but their exit
//! codes do not: an untracked pid is reported as running while it is alive
//! and as not found once it is gone.
//!
//! Inputs are staged into, and outputs collected from, the directory the
//! child runs in: the spec's working directory when set, the job workspace
//! otherwise.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use process_utils::PidState;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    AdapterError, AdapterResult, BackendAdapter, BackendState, BackendStatus, SubmitRequest,
    Submission,
};
use crate::domain::{BackendKind, FileTransfer};
use crate::scheduler::SchedulerEndpoint;
use crate::workspace::WorkspaceDir;

pub const STDOUT_FILE: &str = "stdout.log";
pub const STDERR_FILE: &str = "stderr.log";

#[derive(Debug, Clone)]
enum ChildState {
    Running { stop: CancellationToken },
    /// `code` is `None` when the process was terminated by a signal.
    Exited { code: Option<i32> },
    /// Exited cleanly but its outputs could not be delivered.
    TransferFailed { reason: String },
}

/// Adapter that runs jobs as local child processes.
#[derive(Debug, Clone, Default)]
pub struct LocalProcessAdapter {
    children: Arc<DashMap<u32, ChildState>>,
    /// Correlation token to pid, for lookups after an interrupted submit.
    submissions: Arc<DashMap<String, u32>>,
}

impl LocalProcessAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of children with a tracked state.
    pub fn tracked(&self) -> usize {
        self.children.len()
    }

    fn parse_handle(handle: &str) -> AdapterResult<u32> {
        handle
            .parse::<u32>()
            .map_err(|_| AdapterError::Rejected(format!("'{}' is not a process id", handle)))
    }

    fn watch(
        &self,
        pid: u32,
        mut child: tokio::process::Child,
        stop: CancellationToken,
        run_dir: WorkspaceDir,
        outputs: Vec<FileTransfer>,
    ) {
        let children = self.children.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        error!(pid, error = %e, "Error waiting for job process");
                        None
                    }
                },
                _ = stop.cancelled() => {
                    debug!(pid, "Stop requested, killing job process");
                    if let Err(e) = child.kill().await {
                        warn!(pid, error = %e, "Failed to kill job process");
                    }
                    child.wait().await.ok().and_then(|status| status.code())
                }
            };
            debug!(pid, ?code, "Job process exited");

            let clean_exit = code == Some(0) && !stop.is_cancelled();
            let state = if !clean_exit {
                ChildState::Exited { code }
            } else if let Err(e) = collect_outputs(&run_dir, &outputs).await {
                warn!(pid, error = %e, "Failed to deliver job outputs");
                ChildState::TransferFailed {
                    reason: e.to_string(),
                }
            } else {
                ChildState::Exited { code }
            };
            // A released child stays released.
            if let Some(mut entry) = children.get_mut(&pid) {
                *entry = state;
            }
        });
    }
}

/// Copy each `remote` input into the workspace at `local`.
async fn stage_inputs(workdir: &WorkspaceDir, inputs: &[FileTransfer]) -> AdapterResult<()> {
    for transfer in inputs {
        let dest = workdir
            .file(&transfer.local)
            .map_err(|e| AdapterError::Rejected(e.to_string()))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AdapterError::Rejected(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        tokio::fs::copy(&transfer.remote, &dest).await.map_err(|e| {
            AdapterError::Rejected(format!("cannot stage input '{}': {}", transfer.remote, e))
        })?;
    }
    Ok(())
}

/// Copy each `local` output of the run directory to its `remote` path.
async fn collect_outputs(run_dir: &WorkspaceDir, outputs: &[FileTransfer]) -> AdapterResult<()> {
    for transfer in outputs {
        let source = run_dir
            .file(&transfer.local)
            .map_err(|e| AdapterError::Rejected(e.to_string()))?;
        let dest = Path::new(&transfer.remote);
        if let Some(parent) = dest.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AdapterError::Rejected(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        tokio::fs::copy(&source, dest).await.map_err(|e| {
            AdapterError::Rejected(format!(
                "cannot deliver output '{}' to '{}': {}",
                transfer.local, transfer.remote, e
            ))
        })?;
    }
    Ok(())
}

async fn capture_file(path: &Path) -> AdapterResult<Stdio> {
    let file = tokio::fs::File::create(path).await.map_err(|e| {
        AdapterError::Rejected(format!("cannot create {}: {}", path.display(), e))
    })?;
    Ok(Stdio::from(file.into_std().await))
}

#[async_trait]
impl BackendAdapter for LocalProcessAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalProcess
    }

    async fn submit(
        &self,
        request: &SubmitRequest<'_>,
        _endpoint: &SchedulerEndpoint,
    ) -> AdapterResult<Submission> {
        let spec = request.spec;
        let workdir = request.workdir;
        workdir.ensure().await.map_err(|e| {
            AdapterError::Rejected(format!(
                "cannot create workspace {}: {}",
                workdir.path().display(),
                e
            ))
        })?;

        let run_dir = match &spec.working_directory {
            Some(dir) => {
                let run_dir = WorkspaceDir::new(dir.clone());
                run_dir.ensure().await.map_err(|e| {
                    AdapterError::Rejected(format!("cannot create {}: {}", dir.display(), e))
                })?;
                run_dir
            }
            None => workdir.clone(),
        };
        stage_inputs(&run_dir, &spec.input_files).await?;
        let cwd = run_dir.path().to_path_buf();
        let stdout_path = workdir.path().join(STDOUT_FILE);
        let stderr_path = workdir.path().join(STDERR_FILE);

        let stdout = capture_file(&stdout_path).await?;
        let stderr = capture_file(&stderr_path).await?;

        let mut command = process_utils::tokio_command(&spec.command);
        command
            .args(&spec.arguments)
            .envs(&spec.environment)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        let child = command.spawn().map_err(|e| {
            AdapterError::Rejected(format!("failed to spawn '{}': {}", spec.command, e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| AdapterError::Rejected("spawned process has no pid".into()))?;

        let stop = CancellationToken::new();
        self.children
            .insert(pid, ChildState::Running { stop: stop.clone() });
        self.submissions
            .insert(request.correlation_token.clone(), pid);
        self.watch(pid, child, stop, run_dir, spec.output_files.clone());

        info!(job_id = %request.job_id, pid, command = %spec.command, "Spawned job process");

        Ok(Submission::new(pid.to_string())
            .with_metadata("pid", pid)
            .with_metadata("workdir", cwd.to_string_lossy().into_owned())
            .with_metadata("stdout", stdout_path.to_string_lossy().into_owned())
            .with_metadata("stderr", stderr_path.to_string_lossy().into_owned()))
    }

    async fn find_submission(
        &self,
        correlation_token: &str,
        _endpoint: &SchedulerEndpoint,
    ) -> AdapterResult<Option<Submission>> {
        let pid = self.submissions.get(correlation_token).map(|entry| *entry.value());
        Ok(pid.map(|pid| Submission::new(pid.to_string()).with_metadata("pid", pid)))
    }

    async fn poll(
        &self,
        handle: &str,
        _endpoint: &SchedulerEndpoint,
    ) -> AdapterResult<BackendStatus> {
        let pid = Self::parse_handle(handle)?;
        let tracked = self.children.get(&pid).map(|state| state.value().clone());
        let state = match tracked {
            Some(ChildState::Running { .. }) => BackendState::Running,
            Some(ChildState::Exited { code: Some(exit_code) }) => {
                BackendState::Completed { exit_code }
            }
            Some(ChildState::Exited { code: None }) => BackendState::Failed {
                reason: "process terminated by a signal".to_string(),
            },
            Some(ChildState::TransferFailed { reason }) => BackendState::Failed { reason },
            None => {
                let probed = tokio::task::spawn_blocking(move || process_utils::pid_state(pid))
                    .await
                    .map_err(|e| AdapterError::Transient(format!("pid probe failed: {}", e)))?;
                match probed {
                    PidState::Alive => {
                        return Ok(BackendStatus::new(BackendState::Running)
                            .with_metadata("tracked", false));
                    }
                    PidState::Zombie | PidState::Gone => return Err(AdapterError::NotFound),
                }
            }
        };
        Ok(BackendStatus::new(state))
    }

    async fn cancel(&self, handle: &str, _endpoint: &SchedulerEndpoint) -> AdapterResult<()> {
        let pid = Self::parse_handle(handle)?;
        let tracked = self.children.get(&pid).map(|state| state.value().clone());
        match tracked {
            Some(ChildState::Running { stop }) => {
                stop.cancel();
                Ok(())
            }
            Some(ChildState::Exited { .. } | ChildState::TransferFailed { .. }) => Ok(()),
            None => {
                let delivered = tokio::task::spawn_blocking(move || process_utils::terminate(pid))
                    .await
                    .map_err(|e| AdapterError::Transient(format!("kill failed: {}", e)))?;
                if delivered {
                    Ok(())
                } else {
                    Err(AdapterError::Transient(format!(
                        "could not signal process {}",
                        pid
                    )))
                }
            }
        }
    }

    async fn release(&self, handle: &str, _endpoint: &SchedulerEndpoint) -> AdapterResult<()> {
        let pid = Self::parse_handle(handle)?;
        self.children.remove(&pid);
        self.submissions.retain(|_, tracked| *tracked != pid);
        Ok(())
    }
}
