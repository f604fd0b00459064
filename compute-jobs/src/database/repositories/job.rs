//! Job repository.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::database::models::{JobDbModel, JobEventDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::domain::{JobEvent, JobRecord, JobStatus};
use crate::{Error, Result};

/// Default number of rows returned by [`JobRepository::list_jobs`].
pub const DEFAULT_LIST_LIMIT: u32 = 100;

/// Filters for listing jobs.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub application_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: u32,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            application_id: None,
            status: None,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

impl JobFilter {
    pub fn matches(&self, record: &JobRecord) -> bool {
        self.application_id
            .as_deref()
            .is_none_or(|app| app == record.application_id)
            && self.status.is_none_or(|s| s == record.status)
    }
}

/// Persistence contract for job records.
///
/// All record mutation goes through [`compare_and_update`], which only
/// succeeds when the stored version still equals the version the caller read.
///
/// [`compare_and_update`]: JobRepository::compare_and_update
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create_job(&self, record: &JobRecord) -> Result<()>;
    async fn get_job(&self, id: Uuid) -> Result<JobRecord>;
    /// Persist `record` if the stored version equals `expected_version`.
    ///
    /// Returns the stored record with its bumped version, `VersionConflict`
    /// if another writer got there first, or `NotFound`.
    async fn compare_and_update(
        &self,
        record: &JobRecord,
        expected_version: i64,
    ) -> Result<JobRecord>;
    async fn delete_job(&self, id: Uuid) -> Result<()>;
    /// Records in PENDING, SUBMITTED or RUNNING, oldest first.
    async fn list_non_terminal(&self) -> Result<Vec<JobRecord>>;
    /// Newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>>;
    async fn count_active_for_scheduler(&self, scheduler: &str) -> Result<u64>;
    async fn count_by_status(&self) -> Result<Vec<(JobStatus, u64)>>;

    // Event log
    async fn add_event(&self, event: &JobEvent) -> Result<()>;
    async fn list_events(&self, job_id: Uuid) -> Result<Vec<JobEvent>>;
}

const NON_TERMINAL_SQL: &str = "('PENDING', 'SUBMITTED', 'RUNNING')";

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn into_records(rows: Vec<JobDbModel>) -> Result<Vec<JobRecord>> {
        rows.into_iter().map(JobDbModel::into_record).collect()
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn create_job(&self, record: &JobRecord) -> Result<()> {
        let job = JobDbModel::from_record(record)?;
        retry_on_sqlite_busy("create_job", || async {
            sqlx::query(
                r#"
                INSERT INTO job (
                    id, application_id, backend_kind, scheduler, status, backend_handle,
                    spec, metadata, last_error, created_at, submitted_at, completed_at,
                    updated_at, version
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job.id)
            .bind(&job.application_id)
            .bind(&job.backend_kind)
            .bind(&job.scheduler)
            .bind(&job.status)
            .bind(&job.backend_handle)
            .bind(&job.spec)
            .bind(&job.metadata)
            .bind(&job.last_error)
            .bind(job.created_at)
            .bind(job.submitted_at)
            .bind(job.completed_at)
            .bind(job.updated_at)
            .bind(job.version)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_job(&self, id: Uuid) -> Result<JobRecord> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))?
            .into_record()
    }

    async fn compare_and_update(
        &self,
        record: &JobRecord,
        expected_version: i64,
    ) -> Result<JobRecord> {
        let job = JobDbModel::from_record(record)?;
        let rows = retry_on_sqlite_busy("compare_and_update", || async {
            let result = sqlx::query(
                r#"
                UPDATE job SET
                    status = ?,
                    backend_handle = ?,
                    metadata = ?,
                    last_error = ?,
                    submitted_at = ?,
                    completed_at = ?,
                    updated_at = ?,
                    version = version + 1
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(&job.status)
            .bind(&job.backend_handle)
            .bind(&job.metadata)
            .bind(&job.last_error)
            .bind(job.submitted_at)
            .bind(job.completed_at)
            .bind(job.updated_at)
            .bind(&job.id)
            .bind(expected_version)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if rows == 0 {
            let exists: Option<(i64,)> = sqlx::query_as("SELECT version FROM job WHERE id = ?")
                .bind(&job.id)
                .fetch_optional(&self.pool)
                .await?;
            return Err(match exists {
                Some(_) => Error::VersionConflict {
                    id: job.id,
                    expected: expected_version,
                },
                None => Error::not_found("Job", record.id),
            });
        }

        let mut stored = record.clone();
        stored.version = expected_version + 1;
        Ok(stored)
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        // Events are deleted via CASCADE
        let id_str = id.to_string();
        let rows = retry_on_sqlite_busy("delete_job", || async {
            let result = sqlx::query("DELETE FROM job WHERE id = ?")
                .bind(&id_str)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await?;
        if rows == 0 {
            return Err(Error::not_found("Job", id));
        }
        Ok(())
    }

    async fn list_non_terminal(&self) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobDbModel>(&format!(
            "SELECT * FROM job WHERE status IN {} ORDER BY created_at",
            NON_TERMINAL_SQL
        ))
        .fetch_all(&self.pool)
        .await?;
        Self::into_records(rows)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM job WHERE 1 = 1");
        if let Some(app) = &filter.application_id {
            qb.push(" AND application_id = ").push_bind(app);
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(i64::from(filter.limit));

        let rows = qb
            .build_query_as::<JobDbModel>()
            .fetch_all(&self.pool)
            .await?;
        Self::into_records(rows)
    }

    async fn count_active_for_scheduler(&self, scheduler: &str) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM job WHERE scheduler = ? AND status IN {}",
            NON_TERMINAL_SQL
        ))
        .bind(scheduler)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, u64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM job GROUP BY status ORDER BY status")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(status, count)| {
                JobStatus::parse(&status)
                    .map(|s| (s, count.max(0) as u64))
                    .ok_or_else(|| Error::Database(format!("invalid job status '{}'", status)))
            })
            .collect()
    }

    async fn add_event(&self, event: &JobEvent) -> Result<()> {
        let entry = JobEventDbModel::from_event(event)?;
        retry_on_sqlite_busy("add_event", || async {
            sqlx::query(
                r#"
                INSERT INTO job_event (id, job_id, level, message, details, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.id)
            .bind(&entry.job_id)
            .bind(&entry.level)
            .bind(&entry.message)
            .bind(&entry.details)
            .bind(entry.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn list_events(&self, job_id: Uuid) -> Result<Vec<JobEvent>> {
        let rows = sqlx::query_as::<_, JobEventDbModel>(
            "SELECT * FROM job_event WHERE job_id = ? ORDER BY created_at, rowid",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobEventDbModel::into_event).collect()
    }
}
