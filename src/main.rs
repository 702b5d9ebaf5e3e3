use std::sync::Arc;

use anyhow::Result;
use ml_job_orchestrator::{
    algorithm::AlgorithmRegistry, api, artifact_store::ArtifactStore, backend::HttpQueryBackend,
    metastore::SqliteMetastore, planner::HiveQueryPlanner, AppState, Config, JobLifecycle,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ml_job_orchestrator=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.api_key_is_fallback {
        warn!("Using a generated API key; set ML_JOBS_API_KEY to pin one");
    }

    let artifacts = ArtifactStore::new(&config.model_root);
    artifacts.ensure_root().await?;
    let metastore = Arc::new(SqliteMetastore::open(&config.database_path)?);
    let backend = Arc::new(HttpQueryBackend::new(config.query_service_url.clone()));
    let planner = Arc::new(HiveQueryPlanner::new(
        config.udf_name.clone(),
        config.udf_class.clone(),
    ));
    let algorithms = AlgorithmRegistry::new();
    info!(algorithms = ?algorithms.names(), "Registered training algorithms");

    let lifecycle = JobLifecycle::new(
        config.lifecycle.clone(),
        metastore,
        backend,
        planner,
        algorithms,
        artifacts,
    )?;
    let recovered = lifecycle.init().await;
    info!(recovered, "Recovered unfinished jobs");
    lifecycle.start().await?;

    let app = api::router(AppState {
        config: config.clone(),
        lifecycle: lifecycle.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("ml-job-orchestrator listening on {}", config.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    lifecycle.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed listening for shutdown signal: {err}");
    }
}
