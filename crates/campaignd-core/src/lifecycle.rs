//! Orchestrator Lifecycle: the startup and shutdown sequence the `serve`
//! command runs around the Management API and Cron Scheduler.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{info, warn};

use campaignd_db::queries::{campaigns, runs};

use crate::notify::Notifier;
use crate::scheduler::CronScheduler;

/// Knobs that affect the startup/shutdown sequence itself, independent of
/// how the database pool or HTTP listener are constructed.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub enable_cron_on_startup: bool,
    pub recovery_staleness_secs: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            enable_cron_on_startup: true,
            recovery_staleness_secs: 2 * 600,
        }
    }
}

/// What startup hands back to the caller once the orchestrator is live.
pub struct RunningOrchestrator {
    pub scheduler: Arc<CronScheduler>,
}

/// Recover orphaned runs, start the scheduler, and (unless disabled) load
/// every active campaign's schedule. Run once before the API starts serving.
pub async fn start(
    pool: Arc<PgPool>,
    client: Arc<reqwest::Client>,
    notifier: Arc<Notifier>,
    config: &LifecycleConfig,
) -> Result<RunningOrchestrator> {
    let recovered = runs::recover_orphaned_runs(&pool, chrono::Duration::seconds(config.recovery_staleness_secs))
        .await
        .context("failed to recover orphaned runs at startup")?;
    if recovered > 0 {
        warn!(recovered, "recovered runs left running by a previous crash");
    }

    let scheduler = Arc::new(CronScheduler::new(Arc::clone(&pool), Arc::clone(&client), Arc::clone(&notifier)).await?);

    if config.enable_cron_on_startup {
        let active = campaigns::list_active_campaigns(&pool)
            .await
            .context("failed to list active campaigns at startup")?;
        let count = active.len();
        scheduler.schedule_all(active).await;
        info!(count, "scheduled active campaigns at startup");
    } else {
        info!("cron scheduling disabled at startup");
    }

    Ok(RunningOrchestrator { scheduler })
}

/// Wait for `ctrl_c` or `SIGTERM`, then stop the scheduler. In-flight runs
/// are not cancelled; they finish on their own after the process exits the
/// `axum::serve` call this future is meant to be awaited inside of.
pub async fn shutdown_signal(scheduler: Arc<CronScheduler>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, stopping scheduler");
    if let Err(err) = scheduler.stop_all().await {
        warn!(error = %err, "error stopping scheduler during shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_recovery_staleness_is_twenty_minutes() {
        let config = LifecycleConfig::default();
        assert_eq!(config.recovery_staleness_secs, 1200);
        assert!(config.enable_cron_on_startup);
    }
}
