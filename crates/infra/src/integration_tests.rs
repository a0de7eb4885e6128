//! End-to-end runs of the in-memory pipeline.
//!
//! Publication → fan-out job → dispatch → delivery → watcher, with a fake
//! fleet and a fake messenger standing in for the outside world.

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    use postline_core::{
        ChatTarget, Content, Publication, PublicationStatus, RequestStatus, Schedule, Tenant,
        TenantId, WorkerMessage,
    };

    use crate::delivery::{
        DeliveryConfig, DeliveryConsumer, DeliveryPoll, MessengerClient, RetryPolicy, SendError,
        SentMessage,
    };
    use crate::dispatch::{DispatchConfig, DispatchConsumer, DispatchPoll};
    use crate::fanout::{FanoutConfig, FanoutConsumer, FanoutJob, FanoutPoll};
    use crate::fleet::{FleetError, TenantFleet};
    use crate::scheduler::{InMemoryJobStore, Scheduler, SchedulerConfig};
    use crate::store::{InMemoryStore, PublicationStore, SendRequestStore, TenantRegistry};
    use crate::watcher::Watcher;

    type Store = InMemoryStore;

    /// Fleet that only records which tenants were asked for.
    #[derive(Default)]
    struct FakeFleet {
        started: Mutex<Vec<TenantId>>,
    }

    #[async_trait]
    impl TenantFleet for FakeFleet {
        async fn ensure_running(&self, tenant: &Tenant) -> Result<(), FleetError> {
            let mut started = self.started.lock().unwrap();
            if !started.contains(&tenant.id) {
                started.push(tenant.id);
            }
            Ok(())
        }
    }

    /// Messenger that refuses one chat and accepts the rest.
    struct FakeBot {
        blocked_chat: Option<i64>,
    }

    #[async_trait]
    impl MessengerClient for FakeBot {
        async fn probe(&self) -> Result<(), SendError> {
            Ok(())
        }

        async fn send(&self, message: &WorkerMessage) -> Result<SentMessage, SendError> {
            if Some(message.chat_id.0) == self.blocked_chat {
                return Err(SendError::Permanent("403 bot was blocked".into()));
            }
            Ok(SentMessage {
                message_id: message.chat_id.0 * 10,
            })
        }
    }

    struct Pipeline {
        store: Arc<Store>,
        scheduler: Arc<Scheduler<InMemoryJobStore>>,
        fanout: FanoutConsumer<Store, InMemoryJobStore>,
        dispatch: DispatchConsumer<Store, Arc<FakeFleet>, Arc<Watcher<Store>>>,
        fleet: Arc<FakeFleet>,
        watcher: Arc<Watcher<Store>>,
    }

    impl Pipeline {
        fn new() -> Self {
            let store = Arc::new(InMemoryStore::new());
            let job = Arc::new(FanoutJob::new(store.clone()));
            let scheduler = Arc::new(
                Scheduler::new(
                    Arc::new(InMemoryJobStore::new()),
                    job.clone(),
                    SchedulerConfig::default(),
                )
                .with_listener(job),
            );
            let fanout =
                FanoutConsumer::new(store.clone(), scheduler.clone(), FanoutConfig::default());
            let watcher = Arc::new(Watcher::new(store.clone()));
            let fleet = Arc::new(FakeFleet::default());
            let dispatch = DispatchConsumer::new(
                store.clone(),
                fleet.clone(),
                watcher.clone(),
                DispatchConfig::default(),
            );
            Self {
                store,
                scheduler,
                fanout,
                dispatch,
                fleet,
                watcher,
            }
        }

        fn delivery(
            &self,
            tenant: TenantId,
            bot: FakeBot,
        ) -> DeliveryConsumer<Store, FakeBot, Arc<Watcher<Store>>> {
            DeliveryConsumer::new(
                self.store.clone(),
                bot,
                self.watcher.clone(),
                tenant,
                DeliveryConfig {
                    retry: RetryPolicy::no_retry(),
                    ..DeliveryConfig::default()
                },
            )
        }

        async fn publish(&self, schedule: Schedule, chats: &[i64]) -> Publication {
            let tenant = Tenant::new("acme", "123:token");
            self.store.upsert_tenant(&tenant).await.unwrap();
            let publication = Publication::new(
                tenant.id,
                Content::plain("launch day"),
                schedule,
                chats.iter().copied().map(ChatTarget::new).collect(),
            )
            .unwrap();
            self.store.insert_publication(&publication).await.unwrap();
            publication
        }

        /// Drive every stage until the queues are empty.
        async fn run_cycle(&self, publication: &Publication, bot: FakeBot) {
            assert!(matches!(
                self.fanout.poll_once().await.unwrap(),
                FanoutPoll::Scheduled(_)
            ));
            self.scheduler.tick(Utc::now()).await.unwrap().join().await;

            while !matches!(
                self.dispatch.poll_once(Utc::now()).await.unwrap(),
                DispatchPoll::Idle
            ) {}

            let delivery = self.delivery(publication.tenant_id, bot);
            while !matches!(delivery.poll_once().await.unwrap(), DeliveryPoll::Idle) {}
        }

        async fn status(&self, publication: &Publication) -> PublicationStatus {
            self.store
                .get_publication(publication.id)
                .await
                .unwrap()
                .unwrap()
                .status
        }
    }

    #[tokio::test]
    async fn single_publication_is_posted_to_every_chat() {
        let pipeline = Pipeline::new();
        let publication = pipeline
            .publish(Schedule::single(Utc::now() - Duration::seconds(1)), &[11, 22, 33])
            .await;

        pipeline
            .run_cycle(&publication, FakeBot { blocked_chat: None })
            .await;

        assert_eq!(pipeline.status(&publication).await, PublicationStatus::Posted);
        let requests = pipeline
            .store
            .requests_for_publication(publication.id)
            .await
            .unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.status == RequestStatus::Sent));
        assert_eq!(*pipeline.fleet.started.lock().unwrap(), vec![publication.tenant_id]);
        // The one-shot job is gone once it fired.
        assert!(pipeline.scheduler.jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_blocked_chat_fails_the_publication() {
        let pipeline = Pipeline::new();
        let publication = pipeline
            .publish(Schedule::single(Utc::now() - Duration::seconds(1)), &[11, 22])
            .await;

        pipeline
            .run_cycle(&publication, FakeBot { blocked_chat: Some(22) })
            .await;

        assert_eq!(pipeline.status(&publication).await, PublicationStatus::Failed);
        let messages = pipeline.store.all_messages();
        let blocked = messages.iter().find(|m| m.chat_id.0 == 22).unwrap();
        assert!(blocked.last_error.as_deref().unwrap().contains("blocked"));
    }

    #[tokio::test]
    async fn deleted_publication_cancels_its_open_requests() {
        let pipeline = Pipeline::new();
        let publication = pipeline
            .publish(Schedule::single(Utc::now() - Duration::seconds(1)), &[11, 22])
            .await;

        pipeline.fanout.poll_once().await.unwrap();
        pipeline.scheduler.tick(Utc::now()).await.unwrap().join().await;
        pipeline
            .store
            .soft_delete_publication(publication.id, Utc::now())
            .await
            .unwrap();
        while !matches!(
            pipeline.dispatch.poll_once(Utc::now()).await.unwrap(),
            DispatchPoll::Idle
        ) {}

        assert_eq!(pipeline.status(&publication).await, PublicationStatus::Canceled);
        assert!(pipeline.store.all_messages().is_empty());
        assert!(pipeline.fleet.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn daily_publication_records_the_cycle_and_stays_scheduled() {
        let pipeline = Pipeline::new();
        let publication = pipeline.publish(Schedule::daily(8, 0).unwrap(), &[11]).await;

        assert!(matches!(
            pipeline.fanout.poll_once().await.unwrap(),
            FanoutPoll::Scheduled(_)
        ));
        let job = pipeline
            .scheduler
            .get(&publication.job_id())
            .await
            .unwrap()
            .unwrap();

        // Fire the job at its own run time, as the tick loop would.
        pipeline
            .scheduler
            .tick(job.next_run_at)
            .await
            .unwrap()
            .join()
            .await;
        while !matches!(
            pipeline.dispatch.poll_once(Utc::now()).await.unwrap(),
            DispatchPoll::Idle
        ) {}
        let delivery = pipeline.delivery(publication.tenant_id, FakeBot { blocked_chat: None });
        while !matches!(delivery.poll_once().await.unwrap(), DeliveryPoll::Idle) {}

        let stored = pipeline
            .store
            .get_publication(publication.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, PublicationStatus::Scheduled);
        let cycle = stored.last_cycle.unwrap();
        assert_eq!(cycle.cycle_at, job.next_run_at);
        assert_eq!(cycle.status, PublicationStatus::Posted);

        // The job moved on to tomorrow.
        let next = pipeline
            .scheduler
            .get(&publication.job_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.next_run_at, job.next_run_at + Duration::days(1));
    }

    #[tokio::test]
    async fn tenants_only_drain_their_own_queue() {
        let pipeline = Pipeline::new();
        let first = pipeline
            .publish(Schedule::single(Utc::now() - Duration::seconds(1)), &[11])
            .await;
        let second = pipeline
            .publish(Schedule::single(Utc::now() - Duration::seconds(1)), &[22])
            .await;

        pipeline.fanout.poll_once().await.unwrap();
        pipeline.fanout.poll_once().await.unwrap();
        pipeline.scheduler.tick(Utc::now()).await.unwrap().join().await;
        while !matches!(
            pipeline.dispatch.poll_once(Utc::now()).await.unwrap(),
            DispatchPoll::Idle
        ) {}

        let delivery = pipeline.delivery(first.tenant_id, FakeBot { blocked_chat: None });
        while !matches!(delivery.poll_once().await.unwrap(), DeliveryPoll::Idle) {}

        assert_eq!(pipeline.status(&first).await, PublicationStatus::Posted);
        assert_eq!(pipeline.status(&second).await, PublicationStatus::InProgress);
        assert_eq!(pipeline.fleet.started.lock().unwrap().len(), 2);
    }
}
