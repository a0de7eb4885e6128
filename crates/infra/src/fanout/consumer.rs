use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use postline_core::{Publication, PublicationId, PublicationStatus, Schedule};

use super::{FanoutConfig, FanoutPayload};
use crate::scheduler::{JobStore, Scheduler, SchedulerError};
use crate::store::{Store, StoreResult};
use crate::workers::WorkerHandle;

/// Outcome of one poll of the PENDING queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutPoll {
    Idle,
    Scheduled(PublicationId),
    Canceled(PublicationId),
    Failed(PublicationId),
}

/// What startup reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub rescheduled: Vec<PublicationId>,
    pub stale: Vec<PublicationId>,
    pub canceled: Vec<PublicationId>,
    pub failed: Vec<PublicationId>,
    /// Left for the polling loop.
    pub pending: usize,
}

/// Moves PENDING publications onto the scheduler.
pub struct FanoutConsumer<S, J> {
    store: Arc<S>,
    scheduler: Arc<Scheduler<J>>,
    config: FanoutConfig,
}

impl<S, J> FanoutConsumer<S, J>
where
    S: Store,
    J: JobStore + 'static,
{
    pub fn new(store: Arc<S>, scheduler: Arc<Scheduler<J>>, config: FanoutConfig) -> Self {
        Self {
            store,
            scheduler,
            config,
        }
    }

    /// Claim the oldest PENDING publication and register its job.
    pub async fn poll_once(&self) -> StoreResult<FanoutPoll> {
        let Some(publication) = self.store.claim_pending_publication().await? else {
            return Ok(FanoutPoll::Idle);
        };
        let id = publication.id;

        if publication.is_deleted() {
            self.store
                .set_publication_status(id, PublicationStatus::Canceled)
                .await?;
            info!(publication_id = %id, "claimed publication was deleted; canceled");
            return Ok(FanoutPoll::Canceled(id));
        }

        match self.register(&publication, publication.schedule).await {
            Ok(()) => {
                self.store
                    .set_publication_status(id, PublicationStatus::Scheduled)
                    .await?;
                info!(publication_id = %id, job_id = %publication.job_id(), "publication scheduled");
                Ok(FanoutPoll::Scheduled(id))
            }
            Err(err) => {
                error!(publication_id = %id, error = %err, "scheduler registration failed");
                self.store
                    .set_publication_status(id, PublicationStatus::Failed)
                    .await?;
                Ok(FanoutPoll::Failed(id))
            }
        }
    }

    async fn register(
        &self,
        publication: &Publication,
        schedule: Schedule,
    ) -> Result<(), SchedulerError> {
        let payload = FanoutPayload {
            publication_id: publication.id,
        }
        .to_value();
        let job_id = publication.job_id();
        match schedule {
            Schedule::Single { at } => {
                self.scheduler.schedule_once(&job_id, at, payload).await?;
            }
            Schedule::Daily { hour, minute } => {
                self.scheduler
                    .schedule_daily(&job_id, hour, minute, payload)
                    .await?;
            }
        }
        Ok(())
    }

    /// Re-derive scheduler state from the store after a restart.
    ///
    /// Single publications overdue by more than `bootstrap_grace` become
    /// STALE; overdue ones inside the grace are fired right away. Scheduled
    /// work is re-registered idempotently.
    #[instrument(skip(self), err)]
    pub async fn bootstrap(&self, now: DateTime<Utc>) -> StoreResult<BootstrapReport> {
        let grace = chrono::Duration::from_std(self.config.bootstrap_grace)
            .unwrap_or(chrono::Duration::MAX);
        let mut report = BootstrapReport::default();

        let open = self
            .store
            .list_publications(&[
                PublicationStatus::Pending,
                PublicationStatus::Scheduling,
                PublicationStatus::Scheduled,
                PublicationStatus::InProgress,
            ])
            .await?;

        for publication in open {
            let id = publication.id;

            if publication.is_deleted() {
                self.store
                    .set_publication_status(id, PublicationStatus::Canceled)
                    .await?;
                self.forget_job(&publication).await;
                report.canceled.push(id);
                continue;
            }

            let schedule = match (publication.status, publication.schedule) {
                (PublicationStatus::Pending, _) => {
                    report.pending += 1;
                    continue;
                }
                // Fan-out already happened; the watcher settles it.
                (PublicationStatus::InProgress, Schedule::Single { .. }) => continue,
                (_, Schedule::Single { at })
                    if at.checked_add_signed(grace).is_some_and(|deadline| deadline < now) =>
                {
                    if self
                        .store
                        .set_publication_status(id, PublicationStatus::Stale)
                        .await?
                    {
                        warn!(publication_id = %id, due = %at, "overdue beyond grace; stale");
                        report.stale.push(id);
                    }
                    self.forget_job(&publication).await;
                    continue;
                }
                (_, Schedule::Single { at }) if at < now => Schedule::Single { at: now },
                (_, schedule) => schedule,
            };

            match self.register(&publication, schedule).await {
                Ok(()) => {
                    if publication.status == PublicationStatus::Scheduling {
                        self.store
                            .set_publication_status(id, PublicationStatus::Scheduled)
                            .await?;
                    }
                    debug!(publication_id = %id, "job re-registered");
                    report.rescheduled.push(id);
                }
                Err(err) => {
                    error!(publication_id = %id, error = %err, "re-registration failed");
                    self.store
                        .set_publication_status(id, PublicationStatus::Failed)
                        .await?;
                    report.failed.push(id);
                }
            }
        }

        info!(
            rescheduled = report.rescheduled.len(),
            stale = report.stale.len(),
            canceled = report.canceled.len(),
            failed = report.failed.len(),
            pending = report.pending,
            "bootstrap reconciliation finished"
        );
        Ok(report)
    }

    async fn forget_job(&self, publication: &Publication) {
        if let Err(err) = self.scheduler.remove(&publication.job_id()).await {
            warn!(publication_id = %publication.id, error = %err, "failed to remove job");
        }
    }

    /// Poll until shutdown.
    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        WorkerHandle::spawn("fanout", move |mut shutdown| async move {
            loop {
                let delay = match self.poll_once().await {
                    Ok(FanoutPoll::Idle) => self.config.idle_delay,
                    Ok(_) => self.config.global_delay,
                    Err(err) => {
                        error!(error = %err, "fan-out poll failed");
                        self.config.idle_delay
                    }
                };
                if shutdown.sleep(delay).await {
                    break;
                }
            }
        })
    }
}
