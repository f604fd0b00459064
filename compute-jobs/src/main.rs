use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use compute_jobs::backends::{
    AdapterRegistry, BackendAdapter, BatchQueueAdapter, LocalProcessAdapter, TaskGraphAdapter,
    http,
};
use compute_jobs::config::AppConfig;
use compute_jobs::database::{self, repositories::JobRepository, repositories::SqlxJobRepository};
use compute_jobs::scheduler::SchedulerRegistry;
use compute_jobs::workspace::LocalWorkspace;
use compute_jobs::{JobManager, StatusReconciler, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env().context("invalid configuration")?;

    let logging = logging::init_logging(&config.log)?;
    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.clone());

    // Initialize database
    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;
    let repo: Arc<dyn JobRepository> = Arc::new(SqlxJobRepository::new(pool.clone()));

    let schedulers = Arc::new(
        SchedulerRegistry::load(&config.scheduler_registry)
            .context("failed to load scheduler endpoints")?,
    );
    let client = http::build_client(config.manager.backend_timeout())?;
    let adapters: Vec<Arc<dyn BackendAdapter>> = vec![
        Arc::new(BatchQueueAdapter::new(client.clone())),
        Arc::new(TaskGraphAdapter::new(client)),
        Arc::new(LocalProcessAdapter::new()),
    ];
    let adapters = AdapterRegistry::new(adapters)?;
    let workspace = Arc::new(LocalWorkspace::new(&config.workspace_root));

    let manager = Arc::new(JobManager::new(
        repo,
        schedulers,
        adapters,
        workspace,
        config.manager.clone(),
    ));

    let recovered = manager.recover_pending().await?;
    if recovered > 0 {
        info!(recovered, "Recovered pending jobs");
    }

    let reconciler = Arc::new(StatusReconciler::new(
        manager.clone(),
        config.reconciler.clone(),
    ));
    reconciler.start();

    info!(
        database = %config.database_url,
        workspace_root = %config.workspace_root.display(),
        "compute-jobs started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;
    info!("Shutdown signal received");

    reconciler.stop().await;
    shutdown.cancel();
    pool.close().await;

    info!("compute-jobs stopped");
    Ok(())
}
