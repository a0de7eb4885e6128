use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use postline_core::{Tenant, TenantId};

use super::handoff::{self, WorkerConfig};
use super::runtime::{ProcessHandle, ProcessRuntime, ProcessSpec, ProcessState};
use super::{FleetConfig, FleetError, TenantFleet, WORKER_CONFIG_ENV};
use crate::workers::WorkerHandle;

/// In-memory record of a tenant's running worker. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantWorkerHandle {
    pub tenant_id: TenantId,
    pub process: ProcessHandle,
    pub config_path: PathBuf,
    pub restarts: u32,
    pub started_at: DateTime<Utc>,
}

/// What one health sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub healthy: Vec<TenantId>,
    pub repaired: Vec<TenantId>,
    /// Exited cleanly after draining its queue.
    pub drained: Vec<TenantId>,
    /// Crashed past the restart budget.
    pub gave_up: Vec<TenantId>,
}

/// Owns one delivery process per tenant.
///
/// Operations on the same tenant are serialized by a per-tenant lock;
/// different tenants proceed independently.
pub struct FleetManager<R> {
    runtime: R,
    config: FleetConfig,
    workers: Mutex<HashMap<TenantId, TenantWorkerHandle>>,
    locks: StdMutex<HashMap<TenantId, Arc<Mutex<()>>>>,
}

impl<R: ProcessRuntime> FleetManager<R> {
    pub fn new(runtime: R, config: FleetConfig) -> Self {
        Self {
            runtime,
            config,
            workers: Mutex::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    fn tenant_lock(&self, tenant_id: TenantId) -> Result<Arc<Mutex<()>>, FleetError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| FleetError::Runtime("tenant lock table poisoned".into()))?;
        Ok(Arc::clone(locks.entry(tenant_id).or_default()))
    }

    async fn worker(&self, tenant_id: TenantId) -> Option<TenantWorkerHandle> {
        self.workers.lock().await.get(&tenant_id).cloned()
    }

    /// Tenants with a known worker, in id order.
    pub async fn tenants(&self) -> Vec<TenantId> {
        let mut ids: Vec<_> = self.workers.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn workers(&self) -> Vec<TenantWorkerHandle> {
        let mut workers: Vec<_> = self.workers.lock().await.values().cloned().collect();
        workers.sort_by_key(|w| w.tenant_id);
        workers
    }

    /// Start a worker for `tenant` unless a live one is already known.
    ///
    /// A known worker that has stopped since the last sweep is reaped and
    /// replaced. A clean exit does not count against the restart budget.
    #[instrument(skip(self, tenant), fields(tenant = %tenant.id), err)]
    pub async fn ensure_running(&self, tenant: &Tenant) -> Result<(), FleetError> {
        let lock = self.tenant_lock(tenant.id)?;
        let _guard = lock.lock().await;

        let mut restarts = 0;
        if let Some(worker) = self.worker(tenant.id).await {
            let state = self.runtime.inspect(&worker.process).await?;
            if state.is_running() {
                return Ok(());
            }
            if !state.is_clean_exit() {
                restarts = worker.restarts + 1;
            }
            info!(state = ?state, "replacing stopped tenant worker");
            self.reap(tenant.id).await?;
        }

        let config_path = WorkerConfig::for_tenant(tenant, &self.config)
            .write(&self.config.config_dir)
            .await?;
        let spec = ProcessSpec {
            name: self.config.process_name(tenant.id),
            program: self.config.worker_program.clone(),
            args: Vec::new(),
            env: vec![(
                WORKER_CONFIG_ENV.to_string(),
                config_path.to_string_lossy().into_owned(),
            )],
        };

        let process = match self.launch(&spec).await {
            Ok(process) => process,
            Err(err) => {
                if let Err(cleanup) = handoff::remove(&config_path).await {
                    warn!(error = %cleanup, "failed to remove handoff after launch error");
                }
                return Err(err);
            }
        };

        info!(process = %process.name, "tenant worker started");
        self.workers.lock().await.insert(
            tenant.id,
            TenantWorkerHandle {
                tenant_id: tenant.id,
                process,
                config_path,
                restarts,
                started_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn launch(&self, spec: &ProcessSpec) -> Result<ProcessHandle, FleetError> {
        let process = self.runtime.create_or_replace(spec).await?;
        self.runtime.start(&process).await?;
        Ok(process)
    }

    /// Whether the tenant's worker process is running.
    pub async fn check_health(&self, tenant_id: TenantId) -> Result<bool, FleetError> {
        Ok(self.inspect(tenant_id).await?.is_running())
    }

    async fn inspect(&self, tenant_id: TenantId) -> Result<ProcessState, FleetError> {
        match self.worker(tenant_id).await {
            Some(worker) => self.runtime.inspect(&worker.process).await,
            None => Ok(ProcessState::Missing),
        }
    }

    /// Restart an unhealthy worker in place while the restart budget lasts.
    ///
    /// Returns `false` when the budget is exhausted or the tenant is unknown.
    #[instrument(skip(self), fields(tenant = %tenant_id), err)]
    pub async fn repair(&self, tenant_id: TenantId) -> Result<bool, FleetError> {
        let lock = self.tenant_lock(tenant_id)?;
        let _guard = lock.lock().await;

        let Some(worker) = self.worker(tenant_id).await else {
            return Ok(false);
        };
        if self.runtime.inspect(&worker.process).await?.is_running() {
            return Ok(true);
        }
        if worker.restarts >= self.config.max_restarts {
            warn!(restarts = worker.restarts, "restart budget exhausted");
            return Ok(false);
        }

        self.runtime.restart(&worker.process).await?;
        let restarts = worker.restarts + 1;
        if let Some(entry) = self.workers.lock().await.get_mut(&tenant_id) {
            entry.restarts = restarts;
        }
        info!(restarts, "tenant worker restarted");
        Ok(true)
    }

    /// Tear down a tenant's worker; `false` if none was known.
    #[instrument(skip(self), fields(tenant = %tenant_id), err)]
    pub async fn stop(&self, tenant_id: TenantId) -> Result<bool, FleetError> {
        let lock = self.tenant_lock(tenant_id)?;
        let _guard = lock.lock().await;
        self.reap(tenant_id).await
    }

    // Caller holds the tenant lock.
    async fn reap(&self, tenant_id: TenantId) -> Result<bool, FleetError> {
        let Some(worker) = self.workers.lock().await.remove(&tenant_id) else {
            return Ok(false);
        };
        let removed = self.runtime.remove(&worker.process).await;
        handoff::remove(&worker.config_path).await?;
        removed?;
        info!(process = %worker.process.name, "tenant worker reaped");
        Ok(true)
    }

    /// Health-check every known tenant once.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for tenant_id in self.tenants().await {
            let state = match self.inspect(tenant_id).await {
                Ok(state) => state,
                Err(err) => {
                    warn!(tenant = %tenant_id, error = %err, "health check failed");
                    continue;
                }
            };

            if state.is_running() {
                report.healthy.push(tenant_id);
                continue;
            }

            if state.is_clean_exit() {
                if let Err(err) = self.stop(tenant_id).await {
                    error!(tenant = %tenant_id, error = %err, "failed to reap drained worker");
                }
                report.drained.push(tenant_id);
                continue;
            }

            warn!(tenant = %tenant_id, state = ?state, "tenant worker unhealthy");
            match self.repair(tenant_id).await {
                Ok(true) => report.repaired.push(tenant_id),
                Ok(false) | Err(_) => {
                    if let Err(err) = self.stop(tenant_id).await {
                        error!(tenant = %tenant_id, error = %err, "failed to reap worker");
                    }
                    report.gave_up.push(tenant_id);
                }
            }
        }

        report
    }

    /// Run `sweep_once` every `sweep_interval` until shutdown.
    pub fn spawn_sweeper(self: Arc<Self>) -> WorkerHandle {
        let interval = self.config.sweep_interval;
        WorkerHandle::spawn("fleet-sweeper", move |mut shutdown| async move {
            loop {
                let report = self.sweep_once().await;
                if !report.repaired.is_empty() || !report.gave_up.is_empty() {
                    info!(
                        repaired = report.repaired.len(),
                        drained = report.drained.len(),
                        gave_up = report.gave_up.len(),
                        "fleet sweep"
                    );
                }
                if shutdown.sleep(interval).await {
                    break;
                }
            }
        })
    }

    /// Stop every worker.
    pub async fn shutdown(&self) {
        for tenant_id in self.tenants().await {
            if let Err(err) = self.stop(tenant_id).await {
                error!(tenant = %tenant_id, error = %err, "failed to stop worker");
            }
        }
    }
}

#[async_trait]
impl<R: ProcessRuntime> TenantFleet for FleetManager<R> {
    async fn ensure_running(&self, tenant: &Tenant) -> Result<(), FleetError> {
        FleetManager::ensure_running(self, tenant).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::sync::Mutex as SyncMutex;

    /// Runtime whose process states are set by the test.
    #[derive(Default)]
    struct ScriptedRuntime {
        states: SyncMutex<Map<String, ProcessState>>,
        specs: SyncMutex<Map<String, ProcessSpec>>,
        restarts: SyncMutex<Vec<String>>,
        removed: SyncMutex<Vec<String>>,
    }

    impl ScriptedRuntime {
        fn set(&self, name: &str, state: ProcessState) {
            self.states.lock().unwrap().insert(name.to_string(), state);
        }
    }

    #[async_trait]
    impl ProcessRuntime for ScriptedRuntime {
        async fn create_or_replace(&self, spec: &ProcessSpec) -> Result<ProcessHandle, FleetError> {
            self.specs
                .lock()
                .unwrap()
                .insert(spec.name.clone(), spec.clone());
            self.set(&spec.name, ProcessState::Created);
            Ok(ProcessHandle {
                name: spec.name.clone(),
            })
        }

        async fn start(&self, handle: &ProcessHandle) -> Result<(), FleetError> {
            self.set(&handle.name, ProcessState::Running);
            Ok(())
        }

        async fn inspect(&self, handle: &ProcessHandle) -> Result<ProcessState, FleetError> {
            Ok(self
                .states
                .lock()
                .unwrap()
                .get(&handle.name)
                .copied()
                .unwrap_or(ProcessState::Missing))
        }

        async fn restart(&self, handle: &ProcessHandle) -> Result<(), FleetError> {
            self.restarts.lock().unwrap().push(handle.name.clone());
            self.set(&handle.name, ProcessState::Running);
            Ok(())
        }

        async fn remove(&self, handle: &ProcessHandle) -> Result<(), FleetError> {
            self.removed.lock().unwrap().push(handle.name.clone());
            self.states.lock().unwrap().remove(&handle.name);
            Ok(())
        }
    }

    fn manager(dir: &std::path::Path) -> FleetManager<ScriptedRuntime> {
        FleetManager::new(
            ScriptedRuntime::default(),
            FleetConfig {
                config_dir: dir.to_path_buf(),
                ..FleetConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn ensure_running_is_idempotent_per_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = Arc::new(manager(dir.path()));
        let tenant = Tenant::new("acme", "1:a");

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let fleet = fleet.clone();
            let tenant = tenant.clone();
            tasks.push(tokio::spawn(async move { fleet.ensure_running(&tenant).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(fleet.runtime().specs.lock().unwrap().len(), 1);
        let workers = fleet.workers().await;
        assert_eq!(workers.len(), 1);
        assert!(workers[0].config_path.exists());
        assert!(fleet.check_health(tenant.id).await.unwrap());

        let spec = fleet.runtime().specs.lock().unwrap()[&fleet.config.process_name(tenant.id)].clone();
        assert_eq!(spec.env[0].0, WORKER_CONFIG_ENV);
        assert!(spec.name.starts_with("postline-worker-"));
    }

    #[tokio::test]
    async fn crashed_worker_is_restarted_until_budget_runs_out() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = manager(dir.path());
        let tenant = Tenant::new("acme", "1:a");
        fleet.ensure_running(&tenant).await.unwrap();
        let name = fleet.config.process_name(tenant.id);

        for round in 1..=3 {
            fleet.runtime().set(&name, ProcessState::Exited { code: Some(1) });
            let report = fleet.sweep_once().await;
            assert_eq!(report.repaired, vec![tenant.id], "round {round}");
        }
        assert_eq!(fleet.workers().await[0].restarts, 3);

        fleet.runtime().set(&name, ProcessState::Exited { code: Some(1) });
        let report = fleet.sweep_once().await;
        assert_eq!(report.gave_up, vec![tenant.id]);
        assert!(fleet.tenants().await.is_empty());
        assert_eq!(*fleet.runtime().removed.lock().unwrap(), vec![name]);
    }

    #[tokio::test]
    async fn drained_worker_is_reaped_and_handoff_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = manager(dir.path());
        let tenant = Tenant::new("acme", "1:a");
        fleet.ensure_running(&tenant).await.unwrap();
        let config_path = fleet.workers().await[0].config_path.clone();

        fleet
            .runtime()
            .set(&fleet.config.process_name(tenant.id), ProcessState::Exited { code: Some(0) });
        let report = fleet.sweep_once().await;

        assert_eq!(report.drained, vec![tenant.id]);
        assert!(fleet.runtime().restarts.lock().unwrap().is_empty());
        assert!(!config_path.exists());

        // A later request starts a fresh worker.
        fleet.ensure_running(&tenant).await.unwrap();
        assert_eq!(fleet.workers().await[0].restarts, 0);
    }

    #[tokio::test]
    async fn ensure_running_replaces_a_worker_that_exited_before_the_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = manager(dir.path());
        let tenant = Tenant::new("acme", "1:a");
        fleet.ensure_running(&tenant).await.unwrap();
        let name = fleet.config.process_name(tenant.id);

        fleet.runtime().set(&name, ProcessState::Exited { code: Some(0) });
        fleet.ensure_running(&tenant).await.unwrap();

        assert!(fleet.check_health(tenant.id).await.unwrap());
        assert_eq!(fleet.workers().await[0].restarts, 0);
        assert!(fleet.workers().await[0].config_path.exists());
        assert_eq!(*fleet.runtime().removed.lock().unwrap(), vec![name.clone()]);

        let report = fleet.sweep_once().await;
        assert_eq!(report.healthy, vec![tenant.id]);
        assert!(report.drained.is_empty());

        // A crash found this way counts as a restart.
        fleet.runtime().set(&name, ProcessState::Exited { code: Some(1) });
        fleet.ensure_running(&tenant).await.unwrap();
        assert!(fleet.check_health(tenant.id).await.unwrap());
        assert_eq!(fleet.workers().await[0].restarts, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_every_worker() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = manager(dir.path());
        for name in ["a", "b"] {
            fleet.ensure_running(&Tenant::new(name, "1:x")).await.unwrap();
        }

        fleet.shutdown().await;
        assert!(fleet.tenants().await.is_empty());
        assert_eq!(fleet.runtime().removed.lock().unwrap().len(), 2);
    }
}
