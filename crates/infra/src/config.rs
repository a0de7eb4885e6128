//! Pipeline configuration read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::delivery::DeliveryConfig;
use crate::dispatch::DispatchConfig;
use crate::fanout::FanoutConfig;
use crate::fleet::FleetConfig;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Settings shared by the pipeline binaries.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Durable store. `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub scheduler_db_path: PathBuf,
    /// Where stages report status changes.
    pub watcher_url: String,
    /// Listen address of the watcher service.
    pub watcher_bind: String,
    pub scheduler: SchedulerConfig,
    pub fanout: FanoutConfig,
    pub dispatch: DispatchConfig,
    pub fleet: FleetConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let fleet = FleetConfig::default();
        Self {
            database_url: None,
            scheduler_db_path: PathBuf::from("postline-scheduler.db"),
            watcher_url: fleet.watcher_url.clone(),
            watcher_bind: "127.0.0.1:8090".to_string(),
            scheduler: SchedulerConfig::default(),
            fanout: FanoutConfig::default(),
            dispatch: DispatchConfig::default(),
            fleet,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut config = Self::default();

        config.database_url = env.string("DATABASE_URL");
        if let Some(path) = env.string("SCHEDULER_DB_PATH") {
            config.scheduler_db_path = PathBuf::from(path);
        }
        if let Some(url) = env.string("WATCHER_URL") {
            config.watcher_url = url;
        }
        if let Some(bind) = env.string("WATCHER_BIND") {
            config.watcher_bind = bind;
        }

        env.secs("MISFIRE_GRACE_SECS", &mut config.scheduler.misfire_grace)?;

        env.secs("FANOUT_IDLE_DELAY_SECS", &mut config.fanout.idle_delay)?;
        env.secs("FANOUT_GLOBAL_DELAY_SECS", &mut config.fanout.global_delay)?;
        env.minutes("BOOTSTRAP_GRACE_MINUTES", &mut config.fanout.bootstrap_grace)?;

        env.secs("DISPATCH_IDLE_DELAY_SECS", &mut config.dispatch.idle_delay)?;
        env.secs("DISPATCH_GLOBAL_DELAY_SECS", &mut config.dispatch.global_delay)?;
        env.minutes("STALE_THRESHOLD_MINUTES", &mut config.dispatch.stale_threshold)?;

        let fleet = &mut config.fleet;
        env.parse("MAX_TENANT_RESTARTS", &mut fleet.max_restarts)?;
        env.secs("FLEET_SWEEP_INTERVAL_SECS", &mut fleet.sweep_interval)?;
        if let Some(program) = env.string("WORKER_BINARY") {
            fleet.worker_program = PathBuf::from(program);
        }
        if let Some(dir) = env.string("WORKER_CONFIG_DIR") {
            fleet.config_dir = PathBuf::from(dir);
        }
        if let Some(url) = env.string("BOT_API_BASE_URL") {
            fleet.bot_api_base_url = url;
        }
        fleet.media_base_url = env.string("MEDIA_BASE_URL");
        fleet.database_url = config.database_url.clone();
        fleet.watcher_url = config.watcher_url.clone();

        let delivery: &mut DeliveryConfig = &mut fleet.delivery;
        env.secs("DELIVERY_IDLE_DELAY_SECS", &mut delivery.idle_delay)?;
        env.secs("DELIVERY_GLOBAL_DELAY_SECS", &mut delivery.global_delay)?;
        env.parse("MAX_SEND_RETRIES", &mut delivery.retry.max_retries)?;

        Ok(config)
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.string(key) {
            *slot = raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: err.to_string(),
            })?;
        }
        Ok(())
    }

    fn secs(&self, key: &'static str, slot: &mut Duration) -> Result<(), ConfigError> {
        let mut secs = slot.as_secs();
        self.parse(key, &mut secs)?;
        *slot = Duration::from_secs(secs);
        Ok(())
    }

    fn minutes(&self, key: &'static str, slot: &mut Duration) -> Result<(), ConfigError> {
        let mut minutes = slot.as_secs() / 60;
        self.parse(key, &mut minutes)?;
        *slot = Duration::from_secs(minutes * 60);
        Ok(())
    }
}
