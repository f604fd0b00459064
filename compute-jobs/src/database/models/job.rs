//! Job database models.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::domain::{EventLevel, JobError, JobEvent, JobRecord, JobSpecification, JobStatus};
use crate::{Error, Result};

/// Job database model.
/// One row per job record; JSON blobs for the specification, metadata and
/// last error.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    pub application_id: String,
    /// Backend kind: BATCH_QUEUE, TASK_GRAPH, LOCAL_PROCESS
    pub backend_kind: String,
    /// Scheduler endpoint name, duplicated out of `spec` for indexing
    pub scheduler: String,
    /// Status: PENDING, SUBMITTED, RUNNING, COMPLETE, ERROR, ABORTED
    pub status: String,
    pub backend_handle: Option<String>,
    /// JSON blob for the job specification
    pub spec: String,
    /// JSON object owned by the backend adapter
    pub metadata: String,
    /// JSON blob for the structured last error
    pub last_error: Option<String>,
    /// Epoch milliseconds (UTC)
    pub created_at: i64,
    pub submitted_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
    pub version: i64,
}

/// Epoch milliseconds for a timestamp.
#[inline]
pub fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Timestamp from epoch milliseconds, clamping values chrono cannot represent.
pub fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .earliest()
        .unwrap_or(if ms.is_negative() {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

impl JobDbModel {
    pub fn from_record(record: &JobRecord) -> Result<Self> {
        Ok(Self {
            id: record.id.to_string(),
            application_id: record.application_id.clone(),
            backend_kind: record.spec.backend.as_str().to_string(),
            scheduler: record.spec.scheduler.clone(),
            status: record.status.as_str().to_string(),
            backend_handle: record.backend_handle.clone(),
            spec: serde_json::to_string(&record.spec)?,
            metadata: serde_json::to_string(&record.metadata)?,
            last_error: record
                .last_error
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            created_at: to_ms(record.created_at),
            submitted_at: record.submitted_at.map(to_ms),
            completed_at: record.completed_at.map(to_ms),
            updated_at: to_ms(Utc::now()),
            version: record.version,
        })
    }

    pub fn into_record(self) -> Result<JobRecord> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| Error::Database(format!("invalid job id '{}': {}", self.id, e)))?;
        let status = JobStatus::parse(&self.status).ok_or_else(|| {
            Error::Database(format!("invalid status '{}' for job {}", self.status, id))
        })?;
        let spec: JobSpecification = serde_json::from_str(&self.spec)?;
        let last_error: Option<JobError> = self
            .last_error
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(JobRecord {
            id,
            application_id: self.application_id,
            spec,
            status,
            backend_handle: self.backend_handle,
            created_at: from_ms(self.created_at),
            submitted_at: self.submitted_at.map(from_ms),
            completed_at: self.completed_at.map(from_ms),
            last_error,
            metadata: serde_json::from_str(&self.metadata)?,
            version: self.version,
        })
    }
}

/// Job event database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobEventDbModel {
    pub id: String,
    pub job_id: String,
    pub level: String,
    pub message: String,
    /// JSON blob with event details
    pub details: Option<String>,
    pub created_at: i64,
}

impl JobEventDbModel {
    pub fn from_event(event: &JobEvent) -> Result<Self> {
        Ok(Self {
            id: event.id.to_string(),
            job_id: event.job_id.to_string(),
            level: event.level.to_string(),
            message: event.message.clone(),
            details: event
                .details
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            created_at: to_ms(event.created_at),
        })
    }

    pub fn into_event(self) -> Result<JobEvent> {
        let parse_uuid = |raw: &str| {
            Uuid::parse_str(raw)
                .map_err(|e| Error::Database(format!("invalid uuid '{}': {}", raw, e)))
        };
        Ok(JobEvent {
            id: parse_uuid(&self.id)?,
            job_id: parse_uuid(&self.job_id)?,
            level: self.level.parse::<EventLevel>().map_err(|_| {
                Error::Database(format!("invalid event level '{}'", self.level))
            })?,
            message: self.message,
            details: self.details.as_deref().map(serde_json::from_str).transpose()?,
            created_at: from_ms(self.created_at),
        })
    }
}
