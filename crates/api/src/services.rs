//! Wiring shared by the service binaries.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};

use postline_infra::config::PipelineConfig;
use postline_infra::delivery::{BotApiClient, DeliveryConsumer, DeliveryExit, MessengerClient};
use postline_infra::dispatch::DispatchConsumer;
use postline_infra::fanout::{FanoutConsumer, FanoutJob};
use postline_infra::fleet::{FleetManager, LocalProcessRuntime, WorkerConfig};
use postline_infra::scheduler::{Scheduler, SqliteJobStore};
use postline_infra::store::{PostgresStore, Store};
use postline_infra::watcher::Watcher;
use postline_infra::workers::shutdown_channel;

use crate::client::HttpWatcherClient;

const WATCHER_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves on SIGINT, SIGTERM or SIGQUIT.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Connect to the durable store and make sure its schema exists.
pub async fn connect_store(database_url: &str) -> anyhow::Result<Arc<PostgresStore>> {
    let store = PostgresStore::connect(database_url)
        .await
        .context("connecting to the durable store")?;
    store.migrate().await.context("migrating the durable store")?;
    Ok(Arc::new(store))
}

/// Serve the watcher until a shutdown signal arrives.
pub async fn serve_watcher<S: Store>(store: Arc<S>, bind: &str) -> anyhow::Result<()> {
    let app = crate::app::build_app(Arc::new(Watcher::new(store)));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(addr = %listener.local_addr()?, "watcher listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = wait_for_shutdown_signal().await {
                warn!(error = %err, "signal handler failed");
            }
        })
        .await
        .context("watcher server")?;
    Ok(())
}

/// Scheduler plus the fan-out consumer, after startup reconciliation.
pub async fn run_scheduler<S: Store>(store: Arc<S>, config: &PipelineConfig) -> anyhow::Result<()> {
    let jobs = SqliteJobStore::open(&config.scheduler_db_path)
        .await
        .with_context(|| format!("opening {}", config.scheduler_db_path.display()))?;

    let job = Arc::new(FanoutJob::new(store.clone()));
    let scheduler = Arc::new(
        Scheduler::new(Arc::new(jobs), job.clone(), config.scheduler.clone()).with_listener(job),
    );
    let fanout = Arc::new(FanoutConsumer::new(
        store,
        scheduler.clone(),
        config.fanout.clone(),
    ));

    fanout.bootstrap(Utc::now()).await.context("bootstrap")?;

    let handles = [scheduler.spawn(), fanout.spawn()];
    wait_for_shutdown_signal().await?;
    info!("shutting down");
    for handle in handles {
        handle.shutdown().await;
    }
    Ok(())
}

/// Dispatch consumer plus the tenant fleet and its sweeper.
pub async fn run_dispatcher<S: Store>(
    store: Arc<S>,
    config: &PipelineConfig,
) -> anyhow::Result<()> {
    let fleet = Arc::new(FleetManager::new(
        LocalProcessRuntime::new(),
        config.fleet.clone(),
    ));
    let notifier = HttpWatcherClient::new(&config.watcher_url, WATCHER_CLIENT_TIMEOUT)?;
    let dispatch = Arc::new(DispatchConsumer::new(
        store,
        fleet.clone(),
        notifier,
        config.dispatch.clone(),
    ));

    let handles = [dispatch.spawn(), fleet.clone().spawn_sweeper()];
    wait_for_shutdown_signal().await?;
    info!("shutting down");
    for handle in handles {
        handle.shutdown().await;
    }
    fleet.shutdown().await;
    Ok(())
}

/// Deliver one tenant's queue until it drains.
///
/// A failed connectivity probe is returned as an error so the process exits
/// non-zero and the fleet treats it as a crash.
pub async fn run_worker(config: WorkerConfig) -> anyhow::Result<DeliveryExit> {
    let database_url = config
        .database_url
        .clone()
        .context("worker config carries no database_url")?;
    let store = connect_store(&database_url).await?;

    let client = BotApiClient::from_worker_config(&config);
    client.probe().await.context("messenger probe")?;
    info!(tenant = %config.tenant_id, "messenger probe ok");

    let notifier = HttpWatcherClient::new(&config.watcher_url, WATCHER_CLIENT_TIMEOUT)?;
    let consumer = DeliveryConsumer::new(
        store,
        client,
        notifier,
        config.tenant_id,
        config.delivery.clone(),
    );

    let (trigger, signal) = shutdown_channel();
    tokio::spawn(async move {
        if wait_for_shutdown_signal().await.is_ok() {
            trigger.trigger();
        }
    });
    Ok(consumer.run(signal).await)
}
