//! Per-job event log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Severity of a job event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// One entry in a job's history, appended on every status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: Uuid,
    pub job_id: Uuid,
    pub level: EventLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: Uuid, level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            level,
            message: message.into(),
            details: None,
            created_at: Utc::now(),
        }
    }

    pub fn info(job_id: Uuid, message: impl Into<String>) -> Self {
        Self::new(job_id, EventLevel::Info, message)
    }

    pub fn warn(job_id: Uuid, message: impl Into<String>) -> Self {
        Self::new(job_id, EventLevel::Warn, message)
    }

    pub fn error(job_id: Uuid, message: impl Into<String>) -> Self {
        Self::new(job_id, EventLevel::Error, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}
