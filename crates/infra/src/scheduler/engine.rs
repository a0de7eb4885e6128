use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::job::{FiredJob, JobHandler, JobListener, JobOutcome, ScheduledJob};
use super::store::{JobStore, SchedulerError};
use crate::workers::WorkerHandle;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub misfire_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            misfire_grace: Duration::from_secs(60),
        }
    }
}

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub fired: Vec<String>,
    pub missed: Vec<String>,
    /// Due, but the previous run of the same job is still in flight.
    pub skipped: Vec<String>,
    runs: Vec<JoinHandle<()>>,
}

impl TickReport {
    /// Wait for every run started by this tick.
    pub async fn join(self) {
        for run in self.runs {
            if let Err(err) = run.await {
                error!(error = %err, "job run panicked");
            }
        }
    }
}

/// Durable job scheduler.
///
/// A job fires at most once per occurrence and never overlaps with itself.
/// A fire later than the job's misfire grace is reported to listeners as
/// missed instead of run.
pub struct Scheduler<J> {
    store: Arc<J>,
    handler: Arc<dyn JobHandler>,
    listeners: Vec<Arc<dyn JobListener>>,
    running: Arc<Mutex<HashSet<String>>>,
    config: SchedulerConfig,
}

impl<J> Scheduler<J>
where
    J: JobStore + 'static,
{
    pub fn new(store: Arc<J>, handler: Arc<dyn JobHandler>, config: SchedulerConfig) -> Self {
        Self {
            store,
            handler,
            listeners: Vec::new(),
            running: Arc::new(Mutex::new(HashSet::new())),
            config,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn JobListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Add or replace a one-off job.
    #[instrument(skip(self, payload), err)]
    pub async fn schedule_once(
        &self,
        id: &str,
        run_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Result<ScheduledJob, SchedulerError> {
        let mut job = ScheduledJob::once(id, run_at, payload, self.config.misfire_grace);
        self.keep_created_at(&mut job).await?;
        self.store.upsert(&job).await?;
        Ok(job)
    }

    /// Add or replace a job firing every day at `hour:minute` UTC.
    #[instrument(skip(self, payload), err)]
    pub async fn schedule_daily(
        &self,
        id: &str,
        hour: u8,
        minute: u8,
        payload: serde_json::Value,
    ) -> Result<ScheduledJob, SchedulerError> {
        let mut job = ScheduledJob::daily(
            id,
            hour,
            minute,
            payload,
            self.config.misfire_grace,
            Utc::now(),
        )?;
        self.keep_created_at(&mut job).await?;
        self.store.upsert(&job).await?;
        Ok(job)
    }

    async fn keep_created_at(&self, job: &mut ScheduledJob) -> Result<(), SchedulerError> {
        if let Some(existing) = self.store.get(&job.id).await? {
            job.created_at = existing.created_at;
        }
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<bool, SchedulerError> {
        self.store.remove(id).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ScheduledJob>, SchedulerError> {
        self.store.get(id).await
    }

    pub async fn jobs(&self) -> Result<Vec<ScheduledJob>, SchedulerError> {
        self.store.list().await
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running
            .lock()
            .map(|running| running.contains(id))
            .unwrap_or(false)
    }

    /// Fire every job due at `now`.
    ///
    /// The store is updated (one-off job removed, daily job advanced) before
    /// the handler starts, so a crash mid-run never fires the same occurrence
    /// twice.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        let mut report = TickReport::default();

        for job in self.store.due(now).await? {
            if self.is_running(&job.id) {
                debug!(job_id = %job.id, "previous run still in flight; skipping");
                report.skipped.push(job.id);
                continue;
            }

            let missed = job.is_missed(now);
            self.advance(&job, now).await?;

            if missed {
                warn!(
                    job_id = %job.id,
                    scheduled_for = %job.next_run_at,
                    "job missed its run window"
                );
                for listener in &self.listeners {
                    listener.on_missed(&job, now).await;
                }
                report.missed.push(job.id);
                continue;
            }

            report.runs.push(self.start(&job));
            report.fired.push(job.id);
        }

        Ok(report)
    }

    async fn advance(&self, job: &ScheduledJob, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        match job.following_run(now) {
            Some(next_run_at) => {
                let mut next = job.clone();
                next.next_run_at = next_run_at;
                next.updated_at = now;
                self.store.upsert(&next).await
            }
            None => self.store.remove(&job.id).await.map(|_| ()),
        }
    }

    fn start(&self, job: &ScheduledJob) -> JoinHandle<()> {
        if let Ok(mut running) = self.running.lock() {
            running.insert(job.id.clone());
        }

        let fired = FiredJob {
            id: job.id.clone(),
            payload: job.payload.clone(),
            scheduled_for: job.next_run_at,
        };
        let store = Arc::clone(&self.store);
        let handler = Arc::clone(&self.handler);
        let listeners = self.listeners.clone();
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            let job_id = fired.id.clone();
            debug!(job_id = %job_id, scheduled_for = %fired.scheduled_for, "job fired");

            match handler.run(fired.clone()).await {
                Ok(JobOutcome::Continue) => {}
                Ok(JobOutcome::Finished) => {
                    if let Err(err) = store.remove(&job_id).await {
                        error!(job_id = %job_id, error = %err, "failed to remove finished job");
                    }
                }
                Err(err) => {
                    warn!(job_id = %job_id, error = %err, "job run failed");
                    for listener in &listeners {
                        listener.on_error(&fired, &err).await;
                    }
                }
            }

            if let Ok(mut running) = running.lock() {
                running.remove(&job_id);
            }
        })
    }

    /// Tick on `tick_interval` until shutdown.
    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        let interval = self.config.tick_interval;
        WorkerHandle::spawn("scheduler", move |mut shutdown| async move {
            info!(tick_ms = interval.as_millis() as u64, "scheduler running");
            loop {
                if let Err(err) = self.tick(Utc::now()).await {
                    error!(error = %err, "scheduler tick failed");
                }
                if shutdown.sleep(interval).await {
                    break;
                }
            }
        })
    }
}
