use anyhow::{Context, Result};
use tenant_api::{create_app, reconcile_once, start_reconciler_task, AppState, Config};
use tenant_logging::{init_subscriber, LogSettings};
use tenant_orchestrator::db::{backup_database, create_pool, run_migrations};
use tenant_orchestrator::TenantStore;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_subscriber(&LogSettings::from_env());

    info!("Starting tenant-api service...");

    let config = Config::from_env();
    config.validate()?;
    info!(
        "Configuration loaded: bind_addr={}, db_path={}, deployments={}",
        config.bind_addr,
        config.db_path.display(),
        config.deployments_path.display()
    );
    if config.api_key.is_none() {
        warn!("TENANT_API_KEY is not set; the API is unauthenticated");
    }

    // Database setup
    let db_path = &config.db_path;
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let state = AppState::from_config(config.clone(), TenantStore::new(pool));
    let scheduler = state.scheduler.clone();

    // Nothing is registered yet, so anything IN_PROGRESS was interrupted.
    let stale = reconcile_once(&scheduler, config.stale_policy).await?;
    if !stale.is_empty() {
        warn!("{} tenants were interrupted by the last shutdown", stale.len());
    }
    tokio::spawn(start_reconciler_task(
        scheduler.clone(),
        config.reconcile_interval(),
        config.stale_policy,
    ));

    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let aborted = scheduler.shutdown(config.shutdown_grace()).await;
    if !aborted.is_empty() {
        warn!("Aborted {} in-flight operations", aborted.len());
    }
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
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
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
