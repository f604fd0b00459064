//! In-memory job repository for embedding and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::job::{JobFilter, JobRepository};
use crate::domain::{JobEvent, JobRecord, JobStatus};
use crate::{Error, Result};

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, JobRecord>,
    events: Vec<JobEvent>,
}

/// Non-durable [`JobRepository`] with the same compare-and-set semantics as
/// the SQLite implementation.
#[derive(Default)]
pub struct InMemoryJobRepository {
    tables: Mutex<Tables>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored job records.
    pub fn len(&self) -> usize {
        self.tables.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn create_job(&self, record: &JobRecord) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.jobs.contains_key(&record.id) {
            return Err(Error::Database(format!("job {} already exists", record.id)));
        }
        tables.jobs.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<JobRecord> {
        self.tables
            .lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn compare_and_update(
        &self,
        record: &JobRecord,
        expected_version: i64,
    ) -> Result<JobRecord> {
        let mut tables = self.tables.lock();
        let stored = tables
            .jobs
            .get_mut(&record.id)
            .ok_or_else(|| Error::not_found("Job", record.id))?;
        if stored.version != expected_version {
            return Err(Error::VersionConflict {
                id: record.id.to_string(),
                expected: expected_version,
            });
        }
        let mut next = record.clone();
        // identity and specification are immutable
        next.spec = stored.spec.clone();
        next.application_id = stored.application_id.clone();
        next.created_at = stored.created_at;
        next.version = expected_version + 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.jobs.remove(&id).is_none() {
            return Err(Error::not_found("Job", id));
        }
        tables.events.retain(|e| e.job_id != id);
        Ok(())
    }

    async fn list_non_terminal(&self) -> Result<Vec<JobRecord>> {
        let tables = self.tables.lock();
        let mut records: Vec<JobRecord> = tables
            .jobs
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let tables = self.tables.lock();
        let mut records: Vec<JobRecord> = tables
            .jobs
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(filter.limit as usize);
        Ok(records)
    }

    async fn count_active_for_scheduler(&self, scheduler: &str) -> Result<u64> {
        let tables = self.tables.lock();
        Ok(tables
            .jobs
            .values()
            .filter(|r| r.spec.scheduler == scheduler && !r.is_terminal())
            .count() as u64)
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, u64)>> {
        let tables = self.tables.lock();
        let mut counts: HashMap<JobStatus, u64> = HashMap::new();
        for record in tables.jobs.values() {
            *counts.entry(record.status).or_default() += 1;
        }
        let mut counts: Vec<(JobStatus, u64)> = counts.into_iter().collect();
        counts.sort_by_key(|(status, _)| status.as_str());
        Ok(counts)
    }

    async fn add_event(&self, event: &JobEvent) -> Result<()> {
        let mut tables = self.tables.lock();
        if !tables.jobs.contains_key(&event.job_id) {
            return Err(Error::not_found("Job", event.job_id));
        }
        tables.events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, job_id: Uuid) -> Result<Vec<JobEvent>> {
        let tables = self.tables.lock();
        Ok(tables
            .events
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }
}
