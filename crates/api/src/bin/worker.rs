use std::path::PathBuf;

use anyhow::Context;
use postline_infra::delivery::DeliveryExit;
use postline_infra::fleet::{WORKER_CONFIG_ENV, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    postline_observability::init("postline-worker");

    let path = std::env::var(WORKER_CONFIG_ENV)
        .map(PathBuf::from)
        .with_context(|| format!("{WORKER_CONFIG_ENV} must name the worker config file"))?;
    let config = WorkerConfig::load(&path).await?;
    let tenant = config.tenant_id;

    match postline_api::services::run_worker(config).await? {
        DeliveryExit::Drained => tracing::info!(%tenant, "queue drained"),
        DeliveryExit::Shutdown => tracing::info!(%tenant, "stopped by signal"),
    }
    Ok(())
}
