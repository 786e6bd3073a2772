use anyhow::Context;

use orderflow_app::AppContext;
use orderflow_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to read configuration")?;
    orderflow_observability::init_with(config.log_format);

    let ctx = AppContext::build(config)
        .await
        .context("failed to initialize application context")?;

    let recovered = ctx
        .broker()
        .recover_orphaned()
        .await
        .context("failed to requeue orphaned tasks")?;
    if recovered > 0 {
        tracing::warn!(recovered, "requeued tasks left running by a previous process");
    }

    let purged = ctx
        .purge_expired_tasks()
        .await
        .context("failed to purge expired tasks")?;
    tracing::info!(purged, retention = ?ctx.config().task_retention, "finished task retention applied");

    let pool = ctx.spawn_workers();
    tracing::info!(workers = pool.size(), "orderflow worker running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested, draining in-flight tasks");

    pool.shutdown().await;
    ctx.shutdown().await;
    Ok(())
}
