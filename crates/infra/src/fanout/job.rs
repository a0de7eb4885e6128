use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use postline_core::{PublicationId, PublicationStatus, Schedule, SendRequest, Status};

use super::FanoutPayload;
use crate::scheduler::{FiredJob, JobError, JobHandler, JobListener, JobOutcome, ScheduledJob};
use crate::store::{CycleCreation, Store, StoreResult};

/// Scheduler handler that expands a publication into send requests.
///
/// Also listens for jobs that did not run normally: a single publication
/// whose job was missed is marked STALE, one whose fan-out errored is marked
/// FAILED.
pub struct FanoutJob<S> {
    store: Arc<S>,
}

impl<S: Store> FanoutJob<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Create the send requests of the cycle scheduled for `scheduled_for`.
    ///
    /// Safe to repeat: a cycle that already has requests is left alone.
    #[instrument(skip(self), fields(publication_id = %id), err)]
    pub async fn fan_out(
        &self,
        id: PublicationId,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<JobOutcome> {
        let Some(publication) = self.store.get_publication(id).await? else {
            warn!("publication vanished; dropping its job");
            return Ok(JobOutcome::Finished);
        };

        if publication.is_deleted() {
            self.store
                .set_publication_status(id, PublicationStatus::Canceled)
                .await?;
            info!("publication deleted before fan-out; canceled");
            return Ok(JobOutcome::Finished);
        }
        if publication.status.is_terminal() {
            debug!(status = %publication.status, "publication already terminal");
            return Ok(JobOutcome::Finished);
        }

        // A single publication has exactly one cycle keyed by its own instant,
        // so a late re-registration still lands on the same cycle.
        let (cycle_at, next_status, outcome) = match publication.schedule {
            Schedule::Single { at } => (at, PublicationStatus::InProgress, JobOutcome::Finished),
            Schedule::Daily { .. } => {
                (scheduled_for, PublicationStatus::Scheduled, JobOutcome::Continue)
            }
        };

        let requests = SendRequest::fan_out(&publication, cycle_at, now);
        match self
            .store
            .create_cycle(id, cycle_at, &requests, Some(next_status))
            .await?
        {
            CycleCreation::Created(count) => {
                info!(cycle_at = %cycle_at, requests = count, "fan-out created send requests")
            }
            CycleCreation::AlreadyExists(count) => {
                debug!(cycle_at = %cycle_at, requests = count, "cycle already fanned out")
            }
        }
        Ok(outcome)
    }

    /// Mark a single publication STALE after its job was missed.
    #[instrument(skip(self), fields(publication_id = %id), err)]
    pub async fn mark_missed(&self, id: PublicationId) -> StoreResult<bool> {
        let Some(publication) = self.store.get_publication(id).await? else {
            return Ok(false);
        };
        if publication.is_recurring() {
            // The next daily occurrence is still ahead.
            return Ok(false);
        }
        let changed = self
            .store
            .set_publication_status(id, PublicationStatus::Stale)
            .await?;
        if changed {
            warn!("single publication missed its window; marked stale");
        }
        Ok(changed)
    }

    /// Mark a single publication FAILED after its fan-out errored.
    ///
    /// The one-off job is already gone, so nothing would fire it again.
    #[instrument(skip(self), fields(publication_id = %id), err)]
    pub async fn mark_failed(&self, id: PublicationId) -> StoreResult<bool> {
        let Some(publication) = self.store.get_publication(id).await? else {
            return Ok(false);
        };
        if publication.is_recurring() {
            // The next daily occurrence fires regardless.
            return Ok(false);
        }
        let changed = self
            .store
            .set_publication_status(id, PublicationStatus::Failed)
            .await?;
        if changed {
            warn!("single publication fan-out failed; marked failed");
        }
        Ok(changed)
    }
}

#[async_trait]
impl<S: Store> JobHandler for FanoutJob<S> {
    async fn run(&self, job: FiredJob) -> Result<JobOutcome, JobError> {
        let payload = FanoutPayload::from_value(&job.payload)
            .ok_or_else(|| JobError::new(&job.id, "payload has no publication_id"))?;
        self.fan_out(payload.publication_id, job.scheduled_for, Utc::now())
            .await
            .map_err(|err| JobError::new(&job.id, err.to_string()))
    }
}

#[async_trait]
impl<S: Store> JobListener for FanoutJob<S> {
    async fn on_missed(&self, job: &ScheduledJob, _now: DateTime<Utc>) {
        let Some(payload) = FanoutPayload::from_value(&job.payload) else {
            warn!(job_id = %job.id, "missed job has no publication payload");
            return;
        };
        // Errors are already logged by `mark_missed`.
        let _ = self.mark_missed(payload.publication_id).await;
    }

    async fn on_error(&self, job: &FiredJob, _error: &JobError) {
        let Some(payload) = FanoutPayload::from_value(&job.payload) else {
            return;
        };
        if let Err(err) = self.mark_failed(payload.publication_id).await {
            // Left SCHEDULED; startup reconciliation picks it up again.
            error!(job_id = %job.id, error = %err, "could not fail publication after fan-out error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{InMemoryJobStore, Scheduler, SchedulerConfig};
    use crate::store::{
        InMemoryStore, PublicationStore, SendRequestStore, StoreError, TenantRegistry,
        WorkerMessageStore,
    };
    use chrono::TimeZone;
    use postline_core::{
        ChatTarget, Content, CycleOutcome, Publication, RequestStatus, SendRequestId, Tenant,
        TenantId, WorkerMessage, WorkerMessageId,
    };

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    async fn seeded(schedule: Schedule, chats: &[i64]) -> (Arc<InMemoryStore>, Publication) {
        let store = Arc::new(InMemoryStore::new());
        let mut publication = Publication::new(
            TenantId::new(),
            Content::plain("hello"),
            schedule,
            chats.iter().copied().map(ChatTarget::new).collect(),
        )
        .unwrap();
        publication.status = PublicationStatus::Scheduled;
        store.insert_publication(&publication).await.unwrap();
        (store, publication)
    }

    #[tokio::test]
    async fn single_fan_out_covers_every_chat_once() {
        let (store, publication) = seeded(Schedule::single(at()), &[10, 20, 30]).await;
        let job = FanoutJob::new(store.clone());

        let outcome = job.fan_out(publication.id, at(), at()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Finished);
        // A second fire of the same occurrence adds nothing.
        job.fan_out(publication.id, at(), at()).await.unwrap();

        let requests = store.requests_for_publication(publication.id).await.unwrap();
        assert_eq!(requests.len(), 3);
        let mut chats: Vec<i64> = requests.iter().map(|r| r.chat.id.0).collect();
        chats.sort();
        assert_eq!(chats, vec![10, 20, 30]);
        assert!(requests.iter().all(|r| r.cycle_at == at()));

        let stored = store.get_publication(publication.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PublicationStatus::InProgress);
    }

    #[tokio::test]
    async fn daily_fan_out_creates_a_cycle_per_day_and_stays_scheduled() {
        let (store, publication) = seeded(Schedule::daily(12, 0).unwrap(), &[1, 2]).await;
        let job = FanoutJob::new(store.clone());

        let first = job.fan_out(publication.id, at(), at()).await.unwrap();
        let next_day = at() + chrono::Duration::days(1);
        job.fan_out(publication.id, next_day, next_day).await.unwrap();

        assert_eq!(first, JobOutcome::Continue);
        assert_eq!(store.requests_for_cycle(publication.id, at()).await.unwrap().len(), 2);
        assert_eq!(store.requests_for_cycle(publication.id, next_day).await.unwrap().len(), 2);
        let stored = store.get_publication(publication.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PublicationStatus::Scheduled);
    }

    #[tokio::test]
    async fn deleted_publication_is_canceled_without_requests() {
        let (store, publication) = seeded(Schedule::daily(12, 0).unwrap(), &[1]).await;
        store.soft_delete_publication(publication.id, at()).await.unwrap();

        let outcome = FanoutJob::new(store.clone())
            .fan_out(publication.id, at(), at())
            .await
            .unwrap();

        assert_eq!(outcome, JobOutcome::Finished);
        assert!(store.requests_for_publication(publication.id).await.unwrap().is_empty());
        let stored = store.get_publication(publication.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PublicationStatus::Canceled);
    }

    #[tokio::test]
    async fn missed_single_job_marks_publication_stale() {
        let (store, single) = seeded(Schedule::single(at()), &[1]).await;
        let job = FanoutJob::new(store.clone());

        assert!(job.mark_missed(single.id).await.unwrap());
        let stored = store.get_publication(single.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PublicationStatus::Stale);

        let (daily_store, daily) = seeded(Schedule::daily(8, 0).unwrap(), &[1]).await;
        assert!(!FanoutJob::new(daily_store).mark_missed(daily.id).await.unwrap());
    }

    /// In-memory store whose `create_cycle` is unavailable.
    struct CycleOutageStore(InMemoryStore);

    #[async_trait]
    impl PublicationStore for CycleOutageStore {
        async fn insert_publication(&self, publication: &Publication) -> StoreResult<()> {
            self.0.insert_publication(publication).await
        }
        async fn get_publication(&self, id: PublicationId) -> StoreResult<Option<Publication>> {
            self.0.get_publication(id).await
        }
        async fn claim_pending_publication(&self) -> StoreResult<Option<Publication>> {
            self.0.claim_pending_publication().await
        }
        async fn set_publication_status(
            &self,
            id: PublicationId,
            status: PublicationStatus,
        ) -> StoreResult<bool> {
            self.0.set_publication_status(id, status).await
        }
        async fn record_cycle_outcome(
            &self,
            id: PublicationId,
            outcome: CycleOutcome,
        ) -> StoreResult<()> {
            self.0.record_cycle_outcome(id, outcome).await
        }
        async fn list_publications(
            &self,
            statuses: &[PublicationStatus],
        ) -> StoreResult<Vec<Publication>> {
            self.0.list_publications(statuses).await
        }
        async fn soft_delete_publication(
            &self,
            id: PublicationId,
            at: DateTime<Utc>,
        ) -> StoreResult<bool> {
            self.0.soft_delete_publication(id, at).await
        }
    }

    #[async_trait]
    impl SendRequestStore for CycleOutageStore {
        async fn create_cycle(
            &self,
            _publication_id: PublicationId,
            _cycle_at: DateTime<Utc>,
            _requests: &[SendRequest],
            _publication_status: Option<PublicationStatus>,
        ) -> StoreResult<CycleCreation> {
            Err(StoreError::Unavailable("connection reset".into()))
        }
        async fn get_request(&self, id: SendRequestId) -> StoreResult<Option<SendRequest>> {
            self.0.get_request(id).await
        }
        async fn claim_planned_request(&self) -> StoreResult<Option<SendRequest>> {
            self.0.claim_planned_request().await
        }
        async fn set_request_status(
            &self,
            id: SendRequestId,
            status: RequestStatus,
            sent_at: Option<DateTime<Utc>>,
        ) -> StoreResult<bool> {
            self.0.set_request_status(id, status, sent_at).await
        }
        async fn requests_for_cycle(
            &self,
            publication_id: PublicationId,
            cycle_at: DateTime<Utc>,
        ) -> StoreResult<Vec<SendRequest>> {
            self.0.requests_for_cycle(publication_id, cycle_at).await
        }
        async fn requests_for_publication(
            &self,
            publication_id: PublicationId,
        ) -> StoreResult<Vec<SendRequest>> {
            self.0.requests_for_publication(publication_id).await
        }
    }

    #[async_trait]
    impl WorkerMessageStore for CycleOutageStore {
        async fn insert_messages(&self, messages: &[WorkerMessage]) -> StoreResult<()> {
            self.0.insert_messages(messages).await
        }
        async fn get_message(&self, id: WorkerMessageId) -> StoreResult<Option<WorkerMessage>> {
            self.0.get_message(id).await
        }
        async fn claim_pending_message(
            &self,
            tenant_id: TenantId,
        ) -> StoreResult<Option<WorkerMessage>> {
            self.0.claim_pending_message(tenant_id).await
        }
        async fn mark_message_sent(
            &self,
            id: WorkerMessageId,
            at: DateTime<Utc>,
        ) -> StoreResult<bool> {
            self.0.mark_message_sent(id, at).await
        }
        async fn mark_message_failed(&self, id: WorkerMessageId, error: &str) -> StoreResult<bool> {
            self.0.mark_message_failed(id, error).await
        }
        async fn messages_for_request(
            &self,
            request_id: SendRequestId,
        ) -> StoreResult<Vec<WorkerMessage>> {
            self.0.messages_for_request(request_id).await
        }
    }

    #[async_trait]
    impl TenantRegistry for CycleOutageStore {
        async fn upsert_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
            self.0.upsert_tenant(tenant).await
        }
        async fn get_tenant(&self, id: TenantId) -> StoreResult<Option<Tenant>> {
            self.0.get_tenant(id).await
        }
    }

    #[tokio::test]
    async fn failed_single_fan_out_marks_publication_failed() {
        let store = Arc::new(CycleOutageStore(InMemoryStore::new()));
        let mut publication = Publication::new(
            TenantId::new(),
            Content::plain("hello"),
            Schedule::single(at()),
            vec![ChatTarget::new(1)],
        )
        .unwrap();
        publication.status = PublicationStatus::Scheduled;
        store.insert_publication(&publication).await.unwrap();

        let job = Arc::new(FanoutJob::new(store.clone()));
        let scheduler = Scheduler::new(
            Arc::new(InMemoryJobStore::new()),
            job.clone(),
            SchedulerConfig::default(),
        )
        .with_listener(job);
        let payload = FanoutPayload {
            publication_id: publication.id,
        };
        scheduler
            .schedule_once(&publication.job_id(), at(), payload.to_value())
            .await
            .unwrap();

        let report = scheduler.tick(at()).await.unwrap();
        assert_eq!(report.fired, vec![publication.job_id()]);
        report.join().await;

        assert!(scheduler.jobs().await.unwrap().is_empty());
        let stored = store.get_publication(publication.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PublicationStatus::Failed);
    }

    #[tokio::test]
    async fn failed_daily_fan_out_stays_scheduled() {
        let (store, daily) = seeded(Schedule::daily(8, 0).unwrap(), &[1]).await;
        assert!(!FanoutJob::new(store.clone()).mark_failed(daily.id).await.unwrap());
        let stored = store.get_publication(daily.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PublicationStatus::Scheduled);
    }
}
