mod config;
mod error;
mod routes;
mod services;
mod state;

use crate::config::AppConfig;
use crate::services::backup_scheduler::BackupScheduler;
use crate::state::AppState;
use backup_engine::notify::{LogNotifier, RunNotifier, WebhookNotifier};
use backup_engine::{BackupService, EngineConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    let engine_config = EngineConfig::from_file(&config.config_path)?;

    let level = config
        .log_level
        .clone()
        .unwrap_or_else(|| engine_config.log.level.clone());
    backup_engine::utils::logger::init(&level)?;
    tracing::info!("Starting backup server on port {}", config.port);

    std::fs::create_dir_all(&engine_config.registry.work_dir)?;

    let notifier: Arc<dyn RunNotifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };
    let service = Arc::new(BackupService::from_config(&engine_config, notifier).await?);

    // Runs left `running` by a previous process
    let aborted = service.reconcile_interrupted().await?;
    if aborted > 0 {
        tracing::warn!("Marked {} interrupted run(s) as aborted", aborted);
    }

    // Initialize cron scheduler
    let scheduler = match BackupScheduler::new(service.clone()).await {
        Ok(s) => {
            if let Err(e) = s.init_schedules().await {
                tracing::warn!("Failed to initialize schedules: {}", e);
            }
            if let Err(e) = s.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            Some(Arc::new(s))
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    let state = Arc::new(AppState::new(service.clone(), config.clone(), scheduler.clone()));
    let app = routes::create_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await?;

    tracing::info!("Shutting down...");

    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    // Anything still running is reconciled to `aborted` on next start
    let grace = Duration::from_secs(config.shutdown_grace_secs);
    if tokio::time::timeout(grace, service.wait_for_runs()).await.is_err() {
        tracing::warn!("In-flight backup runs did not finish within {:?}", grace);
    }

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
