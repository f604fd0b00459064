//! Contract tests run against both repository implementations.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::task::JoinSet;
use uuid::Uuid;

use compute_jobs::Error;
use compute_jobs::database::repositories::{
    InMemoryJobRepository, JobFilter, JobRepository, SqlxJobRepository,
};
use compute_jobs::database::{init_pool, run_migrations};
use compute_jobs::domain::{
    BackendKind, ErrorKind, EventLevel, JobError, JobEvent, JobRecord, JobSpecification,
    JobStatus, ResourceRequirements,
};

async fn sqlite_repo() -> (Arc<dyn JobRepository>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("jobs.db").display());
    let pool = init_pool(&url).await.unwrap();
    run_migrations(&pool).await.unwrap();
    (Arc::new(SqlxJobRepository::new(pool)), dir)
}

fn memory_repo() -> Arc<dyn JobRepository> {
    Arc::new(InMemoryJobRepository::new())
}

/// Both implementations; the temp dir keeps the SQLite file alive.
async fn repos() -> (Vec<(&'static str, Arc<dyn JobRepository>)>, TempDir) {
    let (sqlite, dir) = sqlite_repo().await;
    (vec![("sqlite", sqlite), ("memory", memory_repo())], dir)
}

fn record(app: &str, scheduler: &str) -> JobRecord {
    let spec = JobSpecification::new(BackendKind::BatchQueue, "/opt/sim/bin/run", scheduler)
        .with_args(["--steps", "100"])
        .with_env("OMP_NUM_THREADS", "4")
        .with_resources(ResourceRequirements {
            cpus: 4,
            memory_mb: 8192,
            gpus: Some(1),
        });
    JobRecord::new(app, spec)
}

async fn submitted(repo: &dyn JobRepository, app: &str, scheduler: &str) -> JobRecord {
    let mut rec = record(app, scheduler);
    repo.create_job(&rec).await.unwrap();
    let version = rec.version;
    rec.mark_submitted("12.0", Default::default()).unwrap();
    repo.compare_and_update(&rec, version).await.unwrap()
}

#[tokio::test]
async fn test_create_and_get_round_trip() {
    let (repos, _dir) = repos().await;
    for (name, repo) in repos {
        let mut rec = record("app-a", "condor");
        rec.metadata.insert("workspace".into(), json!("/data/app-a/x"));
        repo.create_job(&rec).await.unwrap();

        let loaded = repo.get_job(rec.id).await.unwrap();
        assert_eq!(loaded.id, rec.id, "{name}");
        assert_eq!(loaded.application_id, "app-a", "{name}");
        assert_eq!(loaded.spec, rec.spec, "{name}");
        assert_eq!(loaded.status, JobStatus::Pending, "{name}");
        assert_eq!(loaded.metadata, rec.metadata, "{name}");
        assert_eq!(loaded.version, 0, "{name}");
        assert_eq!(
            loaded.created_at.timestamp_millis(),
            rec.created_at.timestamp_millis(),
            "{name}"
        );

        let missing = repo.get_job(Uuid::new_v4()).await.unwrap_err();
        assert!(missing.is_not_found(), "{name}");
    }
}

#[tokio::test]
async fn test_compare_and_update_checks_version() {
    let (repos, _dir) = repos().await;
    for (name, repo) in repos {
        let rec = record("app-a", "condor");
        repo.create_job(&rec).await.unwrap();

        let mut next = rec.clone();
        next.mark_submitted("7.0", Default::default()).unwrap();
        let stored = repo.compare_and_update(&next, 0).await.unwrap();
        assert_eq!(stored.version, 1, "{name}");

        // A writer that read version 0 loses.
        let mut stale = rec.clone();
        stale.mark_aborted().unwrap();
        let err = repo.compare_and_update(&stale, 0).await.unwrap_err();
        assert!(err.is_version_conflict(), "{name}: {err}");

        let loaded = repo.get_job(rec.id).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Submitted, "{name}");
        assert_eq!(loaded.backend_handle.as_deref(), Some("7.0"), "{name}");
        assert_eq!(loaded.version, 1, "{name}");

        let ghost = record("app-a", "condor");
        let err = repo.compare_and_update(&ghost, 0).await.unwrap_err();
        assert!(err.is_not_found(), "{name}");
    }
}

#[tokio::test]
async fn test_last_error_and_completion_persist() {
    let (repos, _dir) = repos().await;
    for (name, repo) in repos {
        let mut rec = submitted(repo.as_ref(), "app-a", "condor").await;
        let version = rec.version;
        rec.mark_failed(JobError::new(
            ErrorKind::NonZeroExit,
            "process exited with code 2",
        ))
        .unwrap();
        repo.compare_and_update(&rec, version).await.unwrap();

        let loaded = repo.get_job(rec.id).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Error, "{name}");
        assert!(loaded.completed_at.is_some(), "{name}");
        let err = loaded.last_error.unwrap();
        assert_eq!(err.kind, ErrorKind::NonZeroExit, "{name}");
        assert!(err.message.contains("code 2"), "{name}");
    }
}

#[tokio::test]
async fn test_non_terminal_listing_and_counts() {
    let (repos, _dir) = repos().await;
    for (name, repo) in repos {
        let pending = record("app-a", "condor");
        repo.create_job(&pending).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3)).await;

        let running = {
            let mut rec = submitted(repo.as_ref(), "app-a", "condor").await;
            let version = rec.version;
            rec.mark_running().unwrap();
            repo.compare_and_update(&rec, version).await.unwrap()
        };
        tokio::time::sleep(Duration::from_millis(3)).await;

        let done = {
            let mut rec = submitted(repo.as_ref(), "app-b", "dask").await;
            let version = rec.version;
            rec.mark_complete().unwrap();
            repo.compare_and_update(&rec, version).await.unwrap()
        };

        let active: Vec<Uuid> = repo
            .list_non_terminal()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(active, vec![pending.id, running.id], "{name}");

        assert_eq!(repo.count_active_for_scheduler("condor").await.unwrap(), 2, "{name}");
        assert_eq!(repo.count_active_for_scheduler("dask").await.unwrap(), 0, "{name}");

        let mut counts = repo.count_by_status().await.unwrap();
        counts.sort_by_key(|(s, _)| s.as_str());
        assert_eq!(
            counts,
            vec![
                (JobStatus::Complete, 1),
                (JobStatus::Pending, 1),
                (JobStatus::Running, 1),
            ],
            "{name}"
        );

        let app_b = repo
            .list_jobs(&JobFilter {
                application_id: Some("app-b".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(app_b.len(), 1, "{name}");
        assert_eq!(app_b[0].id, done.id, "{name}");

        let newest = repo
            .list_jobs(&JobFilter {
                limit: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(newest.len(), 1, "{name}");
        assert_eq!(newest[0].id, done.id, "{name}");

        let pending_only = repo
            .list_jobs(&JobFilter {
                status: Some(JobStatus::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pending_only.len(), 1, "{name}");
    }
}

#[tokio::test]
async fn test_events_are_deleted_with_the_job() {
    let (repos, _dir) = repos().await;
    for (name, repo) in repos {
        let rec = record("app-a", "condor");
        repo.create_job(&rec).await.unwrap();

        repo.add_event(&JobEvent::info(rec.id, "Job created"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(3)).await;
        repo.add_event(
            &JobEvent::new(rec.id, EventLevel::Error, "Submission failed")
                .with_details(json!({"attempts": 2})),
        )
        .await
        .unwrap();

        let events = repo.list_events(rec.id).await.unwrap();
        assert_eq!(events.len(), 2, "{name}");
        assert_eq!(events[0].message, "Job created", "{name}");
        assert_eq!(events[1].level, EventLevel::Error, "{name}");
        assert_eq!(events[1].details, Some(json!({"attempts": 2})), "{name}");

        repo.delete_job(rec.id).await.unwrap();
        assert!(repo.list_events(rec.id).await.unwrap().is_empty(), "{name}");
        assert!(repo.delete_job(rec.id).await.unwrap_err().is_not_found(), "{name}");
    }
}

#[tokio::test]
async fn test_concurrent_writers_single_winner() {
    let (repos, _dir) = repos().await;
    for (name, repo) in repos {
        let rec = record("app-a", "condor");
        repo.create_job(&rec).await.unwrap();

        let mut tasks = JoinSet::new();
        for i in 0..16 {
            let repo = repo.clone();
            let mut next = rec.clone();
            tasks.spawn(async move {
                next.mark_submitted(format!("{i}.0"), Default::default())
                    .unwrap();
                repo.compare_and_update(&next, 0).await
            });
        }

        let mut winners = 0;
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                Ok(_) => winners += 1,
                Err(Error::VersionConflict { .. }) => {}
                Err(e) => panic!("{name}: unexpected error {e}"),
            }
        }
        assert_eq!(winners, 1, "{name}");
        assert_eq!(repo.get_job(rec.id).await.unwrap().version, 1, "{name}");
    }
}
