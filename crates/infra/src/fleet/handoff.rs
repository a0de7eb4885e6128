//! Private config file handed to a tenant's worker process.
//!
//! The file carries the tenant's credentials, so it is written owner
//! read-only and removed when the worker is reaped.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use postline_core::{Tenant, TenantCredentials, TenantId};

use super::{FleetConfig, FleetError};
use crate::delivery::DeliveryConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub tenant_id: TenantId,
    pub tenant_name: String,
    pub credentials: Option<TenantCredentials>,
    pub proxy: Option<String>,
    pub database_url: Option<String>,
    pub watcher_url: String,
    pub bot_api_base_url: String,
    pub media_base_url: Option<String>,
    pub delivery: DeliveryConfig,
}

impl WorkerConfig {
    pub fn for_tenant(tenant: &Tenant, fleet: &FleetConfig) -> Self {
        Self {
            tenant_id: tenant.id,
            tenant_name: tenant.name.clone(),
            credentials: tenant.credentials.clone(),
            proxy: tenant.proxy.clone(),
            database_url: fleet.database_url.clone(),
            watcher_url: fleet.watcher_url.clone(),
            bot_api_base_url: fleet.bot_api_base_url.clone(),
            media_base_url: fleet.media_base_url.clone(),
            delivery: fleet.delivery.clone(),
        }
    }

    /// Write to `{dir}/{tenant}.{random}.json` and return the path.
    pub async fn write(&self, dir: &Path) -> Result<PathBuf, FleetError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| FleetError::Handoff(format!("create {}: {e}", dir.display())))?;

        let path = dir.join(format!("{}.{}.json", self.tenant_id, Uuid::new_v4()));
        let body =
            serde_json::to_vec_pretty(self).map_err(|e| FleetError::Handoff(e.to_string()))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| FleetError::Handoff(format!("write {}: {e}", path.display())))?;
        restrict(&path).await?;
        Ok(path)
    }

    pub async fn load(path: &Path) -> Result<Self, FleetError> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| FleetError::Handoff(format!("read {}: {e}", path.display())))?;
        serde_json::from_slice(&body)
            .map_err(|e| FleetError::Handoff(format!("parse {}: {e}", path.display())))
    }
}

#[cfg(unix)]
async fn restrict(path: &Path) -> Result<(), FleetError> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400))
        .await
        .map_err(|e| FleetError::Handoff(format!("chmod {}: {e}", path.display())))
}

#[cfg(not(unix))]
async fn restrict(path: &Path) -> Result<(), FleetError> {
    let mut permissions = tokio::fs::metadata(path)
        .await
        .map_err(|e| FleetError::Handoff(e.to_string()))?
        .permissions();
    permissions.set_readonly(true);
    tokio::fs::set_permissions(path, permissions)
        .await
        .map_err(|e| FleetError::Handoff(e.to_string()))
}

/// Delete a handoff file; a file that is already gone is fine.
pub async fn remove(path: &Path) -> Result<(), FleetError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(FleetError::Handoff(format!(
            "remove {}: {err}",
            path.display()
        ))),
    }
}
