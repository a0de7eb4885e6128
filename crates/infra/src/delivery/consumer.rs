use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use postline_core::{TenantId, WorkerMessage, WorkerMessageId};
use postline_events::{StatusNotifier, WatchEvent};

use super::DeliveryConfig;
use super::client::{MessengerClient, SendError, SentMessage};
use crate::store::{StoreResult, WorkerMessageStore};
use crate::workers::ShutdownSignal;

/// Why the delivery loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryExit {
    /// The tenant's queue stayed empty; the process can exit 0.
    Drained,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPoll {
    Idle,
    Sent(WorkerMessageId),
    Failed(WorkerMessageId),
}

/// Sends one tenant's messages, oldest first.
pub struct DeliveryConsumer<S, C, N> {
    store: Arc<S>,
    client: C,
    notifier: N,
    tenant_id: TenantId,
    config: DeliveryConfig,
}

impl<S, C, N> DeliveryConsumer<S, C, N>
where
    S: WorkerMessageStore + 'static,
    C: MessengerClient,
    N: StatusNotifier,
{
    pub fn new(
        store: Arc<S>,
        client: C,
        notifier: N,
        tenant_id: TenantId,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            store,
            client,
            notifier,
            tenant_id,
            config,
        }
    }

    /// Claim and deliver one message.
    pub async fn poll_once(&self) -> StoreResult<DeliveryPoll> {
        let Some(message) = self.store.claim_pending_message(self.tenant_id).await? else {
            return Ok(DeliveryPoll::Idle);
        };

        let poll = match self.send_with_retry(&message).await {
            Ok(sent) => {
                self.store.mark_message_sent(message.id, Utc::now()).await?;
                info!(
                    message_id = %message.id,
                    chat_id = %message.chat_id,
                    remote_id = sent.message_id,
                    "message sent"
                );
                DeliveryPoll::Sent(message.id)
            }
            Err(err) => {
                self.store
                    .mark_message_failed(message.id, &err.to_string())
                    .await?;
                error!(message_id = %message.id, chat_id = %message.chat_id, error = %err, "message failed");
                DeliveryPoll::Failed(message.id)
            }
        };

        if let Err(err) = self.notifier.notify(WatchEvent::message(message.id)).await {
            warn!(message_id = %message.id, error = %err, "watcher report failed");
        }
        Ok(poll)
    }

    #[instrument(skip(self, message), fields(message_id = %message.id))]
    async fn send_with_retry(&self, message: &WorkerMessage) -> Result<SentMessage, SendError> {
        let policy = &self.config.retry;
        let mut retries = 0;
        loop {
            match self.client.send(message).await {
                Ok(sent) => return Ok(sent),
                Err(SendError::Transient(reason)) if policy.should_retry(retries) => {
                    retries += 1;
                    let delay = policy.delay_for_retry(retries);
                    warn!(retry = retries, delay_ms = delay.as_millis() as u64, %reason, "transient send failure; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Deliver until the queue stays empty or shutdown is requested.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> DeliveryExit {
        let mut idle_polls = 0;
        loop {
            if shutdown.is_triggered() {
                return DeliveryExit::Shutdown;
            }

            let delay = match self.poll_once().await {
                Ok(DeliveryPoll::Idle) => {
                    idle_polls += 1;
                    if idle_polls >= self.config.idle_polls_before_exit {
                        info!(tenant = %self.tenant_id, "queue drained; exiting");
                        return DeliveryExit::Drained;
                    }
                    self.config.idle_delay
                }
                Ok(_) => {
                    idle_polls = 0;
                    self.config.global_delay
                }
                Err(err) => {
                    error!(tenant = %self.tenant_id, error = %err, "delivery poll failed");
                    self.config.idle_delay
                }
            };

            if shutdown.sleep(delay).await {
                return DeliveryExit::Shutdown;
            }
        }
    }
}
