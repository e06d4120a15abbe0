mod settings;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use bulk_export::{
    ArtifactArbiter, ClientRegistry, ExportConfig, HttpResourceClient, PostgresJobStore,
    PostgresWorkQueue, UnitProcessor, WorkerPool, WorkerPoolConfig, MIGRATOR,
};
use sqlx::postgres::PgPoolOptions;

use settings::WorkerSettings;
use telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded .env from {:?}", path);
    }

    // Configure via environment variables:
    // - OTEL_SERVICE_NAME: Service name (default: "bulk-export-worker")
    // - OTEL_EXPORTER_OTLP_ENDPOINT: OTLP endpoint (e.g., "http://localhost:4317")
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "bulk_export=debug")
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("bulk_export=debug,bulk_export_worker=debug".to_string());
    }
    telemetry_config.service_version = Some(env!("CARGO_PKG_VERSION").to_string());

    // Keep the guard alive for the lifetime of the application
    let _telemetry_guard = init_telemetry(telemetry_config);

    tracing::info!("bulk-export-worker starting...");

    let settings = WorkerSettings::from_env()?;
    let export_config = ExportConfig::from_env();
    let pool_config = WorkerPoolConfig::from_env();

    let db = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect(&settings.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Connected to database");

    if settings.run_migrations {
        MIGRATOR
            .run(&db)
            .await
            .context("Failed to run database migrations")?;
        tracing::info!("Migrations applied");
    }

    let client = HttpResourceClient::new(&settings.upstream_base_url, settings.upstream_timeout)
        .context("Failed to build upstream client")?;
    let arbiter = Arc::new(ArtifactArbiter::new());
    let jobs = Arc::new(PostgresJobStore::new(db.clone()));
    let queue = Arc::new(PostgresWorkQueue::new(db));

    let processor = Arc::new(UnitProcessor::new(
        jobs.clone(),
        ClientRegistry::uniform(Arc::new(client)),
        Arc::clone(&arbiter),
        export_config.payload_dir.clone(),
    ));

    tracing::info!(
        worker_id = %pool_config.worker_id,
        max_concurrency = pool_config.max_concurrency,
        payload_dir = %export_config.payload_dir.display(),
        upstream = %settings.upstream_base_url,
        "Starting export worker pool"
    );

    let pool = WorkerPool::new(queue, jobs, processor, pool_config);
    pool.start().await.context("Failed to start worker pool")?;

    shutdown_signal().await;
    tracing::info!("Received shutdown signal");

    let drained = pool.shutdown().await;
    arbiter.close().await;

    if let Err(e) = drained {
        tracing::error!(error = %e, "Worker pool did not drain cleanly");
        return Err(e.into());
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
