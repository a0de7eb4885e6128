//! Persistence for scheduled jobs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::job::ScheduledJob;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job store error: {0}")]
    Store(String),

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("job payload could not be encoded: {0}")]
    Payload(String),
}

/// Job persistence keyed by job id. `upsert` replaces an existing job.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn upsert(&self, job: &ScheduledJob) -> Result<(), SchedulerError>;

    async fn remove(&self, id: &str) -> Result<bool, SchedulerError>;

    async fn get(&self, id: &str) -> Result<Option<ScheduledJob>, SchedulerError>;

    async fn list(&self) -> Result<Vec<ScheduledJob>, SchedulerError>;

    /// Jobs with `next_run_at <= now`, earliest first.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, SchedulerError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn upsert(&self, job: &ScheduledJob) -> Result<(), SchedulerError> {
        (**self).upsert(job).await
    }

    async fn remove(&self, id: &str) -> Result<bool, SchedulerError> {
        (**self).remove(id).await
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduledJob>, SchedulerError> {
        (**self).get(id).await
    }

    async fn list(&self) -> Result<Vec<ScheduledJob>, SchedulerError> {
        (**self).list().await
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, SchedulerError> {
        (**self).due(now).await
    }
}

/// In-memory job store (tests/dev). Does not survive restart.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, ScheduledJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> SchedulerError {
    SchedulerError::Store("in-memory job store lock poisoned".into())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn upsert(&self, job: &ScheduledJob) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let mut job = job.clone();
        if let Some(existing) = jobs.get(&job.id) {
            job.created_at = existing.created_at;
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool, SchedulerError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        Ok(jobs.remove(id).is_some())
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduledJob>, SchedulerError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut out: Vec<_> = jobs.values().cloned().collect();
        out.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut out: Vec<_> = jobs.values().filter(|j| j.is_due(now)).cloned().collect();
        out.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }
}
