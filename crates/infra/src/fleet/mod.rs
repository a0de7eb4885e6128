//! Tenant fleet: one isolated delivery process per tenant, started on demand,
//! health-checked and repaired by a sweep loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use postline_core::{Tenant, TenantId};

use crate::delivery::DeliveryConfig;

pub mod handoff;
pub mod local;
pub mod manager;
pub mod runtime;

pub use handoff::WorkerConfig;
pub use local::LocalProcessRuntime;
pub use manager::{FleetManager, SweepReport, TenantWorkerHandle};
pub use runtime::{ProcessHandle, ProcessRuntime, ProcessSpec, ProcessState};

/// Environment variable naming the handoff file inside a worker process.
pub const WORKER_CONFIG_ENV: &str = "POSTLINE_WORKER_CONFIG";

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("process runtime error: {0}")]
    Runtime(String),

    #[error("no process named {0}")]
    MissingProcess(String),

    #[error("config handoff failed: {0}")]
    Handoff(String),
}

impl From<std::io::Error> for FleetError {
    fn from(err: std::io::Error) -> Self {
        Self::Runtime(err.to_string())
    }
}

/// The part of the fleet the dispatch stage depends on.
#[async_trait]
pub trait TenantFleet: Send + Sync {
    /// Make sure a delivery process for `tenant` exists. Idempotent.
    async fn ensure_running(&self, tenant: &Tenant) -> Result<(), FleetError>;
}

#[async_trait]
impl<F> TenantFleet for Arc<F>
where
    F: TenantFleet + ?Sized,
{
    async fn ensure_running(&self, tenant: &Tenant) -> Result<(), FleetError> {
        (**self).ensure_running(tenant).await
    }
}

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub max_restarts: u32,
    pub sweep_interval: Duration,
    /// Executable started for each tenant.
    pub worker_program: PathBuf,
    /// Directory receiving handoff files.
    pub config_dir: PathBuf,
    /// Process names are `{name_prefix}-{tenant}`.
    pub name_prefix: String,
    /// Passed through to workers.
    pub database_url: Option<String>,
    pub watcher_url: String,
    pub bot_api_base_url: String,
    pub media_base_url: Option<String>,
    pub delivery: DeliveryConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            sweep_interval: Duration::from_secs(5),
            worker_program: PathBuf::from("postline-worker"),
            config_dir: std::env::temp_dir().join("postline-workers"),
            name_prefix: "postline-worker".to_string(),
            database_url: None,
            watcher_url: "http://127.0.0.1:8090".to_string(),
            bot_api_base_url: "https://api.telegram.org".to_string(),
            media_base_url: None,
            delivery: DeliveryConfig::default(),
        }
    }
}

impl FleetConfig {
    pub fn process_name(&self, tenant_id: TenantId) -> String {
        format!("{}-{}", self.name_prefix, tenant_id)
    }
}
