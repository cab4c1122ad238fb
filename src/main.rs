use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use queryferry::config::AppConfig;
use queryferry::db::JobDb;
use queryferry::runner::JobRunner;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(AppConfig::load());
    init_tracing(&config.listener_log_level);

    let db = Arc::new(JobDb::new(&config.database_path()).await?);
    let runner = JobRunner::new(db, config.clone());

    let requeued = runner.recover().await?;
    if requeued > 0 {
        warn!("requeued {requeued} inflight jobs from previous run");
    }

    info!(
        generation = %runner.generation(),
        interval_seconds = config.listener_interval_seconds,
        global_cap = config.global_max_parallel_queries,
        "queryferry processor started"
    );
    let listener = runner.spawn_listener();

    shutdown_signal().await;
    runner.shutdown(config.shutdown_grace()).await;
    let _ = listener.await;

    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            let _ = sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
