//! The job record and its lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::spec::JobSpecification;
use crate::{Error, Result};

/// Lifecycle status of a job.
///
/// ```text
/// PENDING -> SUBMITTED -> RUNNING -> {COMPLETE, ERROR, ABORTED}
/// PENDING -> {ERROR, ABORTED}
/// SUBMITTED -> {COMPLETE, ERROR, ABORTED}
/// ```
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Persisted, not yet handed to a backend.
    Pending,
    /// Accepted by the backend; a handle is assigned.
    Submitted,
    /// Executing (or held) on the backend.
    Running,
    /// Finished successfully.
    Complete,
    /// Failed, either at submission or during execution.
    Error,
    /// Cancelled by a caller or removed on the backend.
    Aborted,
}

impl JobStatus {
    pub const NON_TERMINAL: [JobStatus; 3] = [Self::Pending, Self::Submitted, Self::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SUBMITTED" => Some(Self::Submitted),
            "RUNNING" => Some(Self::Running),
            "COMPLETE" => Some(Self::Complete),
            "ERROR" => Some(Self::Error),
            "ABORTED" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Aborted)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Submitted => 1,
            Self::Running => 2,
            Self::Complete | Self::Error | Self::Aborted => 3,
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Only forward moves are legal; PENDING can only leave through
    /// submission, a failure or a cancel.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Self::Pending, Self::Running | Self::Complete) => false,
            _ => next.rank() > self.rank(),
        }
    }
}

/// Classification of a recorded job failure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The adapter could not hand the job to the backend.
    SubmissionFailed,
    /// The backend stayed unreachable past the retry ceiling.
    BackendUnreachable,
    /// The backend no longer knows the job's handle.
    JobNotFound,
    /// The job ran and exited with a non-zero code.
    NonZeroExit,
    /// The backend reported a failure other than an exit code.
    BackendFailed,
    /// The job's scheduler endpoint is no longer configured.
    UnknownScheduler,
}

/// Structured last-error of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<JobError> for Error {
    fn from(err: JobError) -> Self {
        match err.kind {
            ErrorKind::SubmissionFailed => Error::SubmissionFailed(err.message),
            ErrorKind::BackendUnreachable => Error::BackendUnreachable(err.message),
            ErrorKind::UnknownScheduler => Error::UnknownScheduler(err.message),
            ErrorKind::JobNotFound => Error::not_found("backend job", err.message),
            ErrorKind::NonZeroExit | ErrorKind::BackendFailed => Error::Other(err.message),
        }
    }
}

/// The durable record of one submitted unit of work.
///
/// Fields are public for reading and serialization; lifecycle changes go
/// through the transition methods so the handle/status and
/// completed-at/terminal invariants always hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub application_id: String,
    pub spec: JobSpecification,
    pub status: JobStatus,
    pub backend_handle: Option<String>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<JobError>,
    /// Adapter-owned metadata.
    pub metadata: Map<String, Value>,
    /// Optimistic concurrency counter, bumped by every persisted update.
    pub version: i64,
}

impl JobRecord {
    /// Create a new PENDING record.
    pub fn new(application_id: impl Into<String>, spec: JobSpecification) -> Self {
        Self {
            id: Uuid::new_v4(),
            application_id: application_id.into(),
            spec,
            status: JobStatus::Pending,
            backend_handle: None,
            created_at: Utc::now(),
            submitted_at: None,
            completed_at: None,
            last_error: None,
            metadata: Map::new(),
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The recorded failure of an ERROR job as an application error.
    pub fn failure(&self) -> Option<Error> {
        match (&self.status, &self.last_error) {
            (JobStatus::Error, Some(err)) => Some(err.clone().into()),
            _ => None,
        }
    }

    /// A timestamp that never precedes any timestamp already on the record.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let latest = [Some(self.created_at), self.submitted_at, self.completed_at]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.created_at);
        Utc::now().max(latest)
    }

    fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_state(self.id, self.status, next.as_str()));
        }
        if next.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(self.next_timestamp());
        }
        self.status = next;
        Ok(())
    }

    /// PENDING -> SUBMITTED with the backend-assigned handle.
    pub fn mark_submitted(
        &mut self,
        handle: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Result<()> {
        if self.status != JobStatus::Pending {
            return Err(Error::invalid_state(self.id, self.status, "mark_submitted"));
        }
        let handle = handle.into();
        if handle.is_empty() {
            return Err(Error::SubmissionFailed("backend returned an empty handle".into()));
        }
        self.submitted_at = Some(self.next_timestamp());
        self.transition(JobStatus::Submitted)?;
        self.backend_handle = Some(handle);
        self.last_error = None;
        self.metadata.extend(metadata);
        Ok(())
    }

    /// Move to RUNNING.
    pub fn mark_running(&mut self) -> Result<()> {
        self.transition(JobStatus::Running)?;
        self.last_error = None;
        Ok(())
    }

    /// Move to COMPLETE.
    pub fn mark_complete(&mut self) -> Result<()> {
        self.transition(JobStatus::Complete)?;
        self.last_error = None;
        Ok(())
    }

    /// Move to ERROR, recording the cause.
    pub fn mark_failed(&mut self, error: JobError) -> Result<()> {
        self.transition(JobStatus::Error)?;
        self.last_error = Some(error);
        Ok(())
    }

    /// Move to ABORTED.
    pub fn mark_aborted(&mut self) -> Result<()> {
        self.transition(JobStatus::Aborted)?;
        self.last_error = None;
        Ok(())
    }

    /// Merge adapter metadata; returns whether anything changed.
    pub fn merge_metadata(&mut self, metadata: &Map<String, Value>) -> bool {
        let mut changed = false;
        for (key, value) in metadata {
            if self.metadata.get(key) != Some(value) {
                self.metadata.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }

    /// Check the record's structural invariants.
    pub fn check_invariants(&self) -> Result<()> {
        let needs_handle = matches!(self.status, JobStatus::Submitted | JobStatus::Running);
        if needs_handle && self.backend_handle.is_none() {
            return Err(Error::Other(format!(
                "job {} is {} without a backend handle",
                self.id, self.status
            )));
        }
        if self.status == JobStatus::Pending && self.backend_handle.is_some() {
            return Err(Error::Other(format!(
                "job {} is PENDING but carries a backend handle",
                self.id
            )));
        }
        if self.is_terminal() != self.completed_at.is_some() {
            return Err(Error::Other(format!(
                "job {} completed_at does not match status {}",
                self.id, self.status
            )));
        }
        Ok(())
    }
}
