//! Dispatch: PLANNED send requests become worker messages for a running
//! tenant process.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use postline_core::{
    MessageKind, Publication, PublicationId, RequestKind, RequestStatus, SendRequest,
    SendRequestId, TenantId, WorkerMessage,
};
use postline_events::{StatusNotifier, WatchEvent};

use crate::fleet::{FleetError, TenantFleet};
use crate::store::{Store, StoreError, StoreResult};
use crate::workers::WorkerHandle;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub idle_delay: Duration,
    pub global_delay: Duration,
    /// Requests older than this are never delivered.
    pub stale_threshold: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            idle_delay: Duration::from_secs(5),
            global_delay: Duration::from_secs(5),
            stale_threshold: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fleet(#[from] FleetError),

    #[error("publication {0} not found")]
    PublicationNotFound(PublicationId),

    #[error("tenant {0} not found")]
    TenantNotFound(TenantId),

    #[error("unsupported request kind '{kind}' on {request_id}")]
    UnsupportedRequest { request_id: String, kind: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPoll {
    Idle,
    Stale(SendRequestId),
    Cancelled(SendRequestId),
    Dispatched { request_id: SendRequestId, messages: usize },
    Failed(SendRequestId),
}

/// The worker messages a request turns into.
pub fn build_messages(request: &SendRequest, publication: &Publication) -> Vec<WorkerMessage> {
    match request.kind {
        RequestKind::Post => vec![WorkerMessage::new(
            request,
            MessageKind::Post,
            &publication.content,
        )],
    }
}

/// Moves PLANNED requests to their tenant's worker.
pub struct DispatchConsumer<S, F, N> {
    store: Arc<S>,
    fleet: F,
    notifier: N,
    config: DispatchConfig,
}

impl<S, F, N> DispatchConsumer<S, F, N>
where
    S: Store,
    F: TenantFleet,
    N: StatusNotifier,
{
    pub fn new(store: Arc<S>, fleet: F, notifier: N, config: DispatchConfig) -> Self {
        Self {
            store,
            fleet,
            notifier,
            config,
        }
    }

    /// Claim one PLANNED request and dispatch it.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> StoreResult<DispatchPoll> {
        let request = match self.store.claim_planned_request().await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(DispatchPoll::Idle),
            Err(StoreError::UnsupportedKind { id, kind, .. }) => {
                return self.fail_unsupported(id, kind).await;
            }
            Err(err) => return Err(err),
        };
        let id = request.id;

        let age = now.signed_duration_since(request.created_at);
        let threshold = chrono::Duration::from_std(self.config.stale_threshold)
            .unwrap_or(chrono::Duration::MAX);
        if age > threshold {
            self.settle(id, RequestStatus::Stale).await?;
            warn!(
                request_id = %id,
                age_minutes = age.num_minutes(),
                "request went stale before dispatch"
            );
            return Ok(DispatchPoll::Stale(id));
        }

        match self.dispatch(&request).await {
            Ok(Some(messages)) => {
                info!(request_id = %id, tenant = %request.tenant_id, messages, "request dispatched");
                Ok(DispatchPoll::Dispatched {
                    request_id: id,
                    messages,
                })
            }
            Ok(None) => {
                self.settle(id, RequestStatus::Cancelled).await?;
                info!(request_id = %id, "publication deleted; request cancelled");
                Ok(DispatchPoll::Cancelled(id))
            }
            Err(err) => {
                error!(request_id = %id, error = %err, "dispatch failed");
                self.settle(id, RequestStatus::Failed).await?;
                Ok(DispatchPoll::Failed(id))
            }
        }
    }

    /// `None` when the owning publication was soft-deleted.
    #[instrument(skip(self, request), fields(request_id = %request.id, tenant = %request.tenant_id))]
    async fn dispatch(&self, request: &SendRequest) -> Result<Option<usize>, DispatchError> {
        let publication = self
            .store
            .get_publication(request.publication_id)
            .await?
            .ok_or(DispatchError::PublicationNotFound(request.publication_id))?;
        if publication.is_deleted() {
            return Ok(None);
        }

        let tenant = self
            .store
            .get_tenant(request.tenant_id)
            .await?
            .ok_or(DispatchError::TenantNotFound(request.tenant_id))?;

        // Queue first so a worker started below always finds the messages.
        let messages = build_messages(request, &publication);
        self.store.insert_messages(&messages).await?;
        if let Err(err) = self.fleet.ensure_running(&tenant).await {
            self.abandon(&messages, &err.to_string()).await;
            return Err(err.into());
        }
        Ok(Some(messages.len()))
    }

    /// Fail messages no worker will pick up so a later worker skips them.
    async fn abandon(&self, messages: &[WorkerMessage], reason: &str) {
        for message in messages {
            if let Err(err) = self.store.mark_message_failed(message.id, reason).await {
                warn!(message_id = %message.id, error = %err, "failed to abandon message");
            }
        }
    }

    async fn fail_unsupported(&self, id: String, kind: String) -> StoreResult<DispatchPoll> {
        let err = DispatchError::UnsupportedRequest {
            request_id: id.clone(),
            kind,
        };
        error!(error = %err, "claimed request cannot be dispatched");
        let request_id = id
            .parse::<SendRequestId>()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        self.settle(request_id, RequestStatus::Failed).await?;
        Ok(DispatchPoll::Failed(request_id))
    }

    /// Write a terminal status and tell the watcher.
    async fn settle(&self, id: SendRequestId, status: RequestStatus) -> StoreResult<()> {
        self.store.set_request_status(id, status, None).await?;
        if let Err(err) = self.notifier.notify(WatchEvent::request(id)).await {
            warn!(request_id = %id, error = %err, "watcher notification failed");
        }
        Ok(())
    }

    /// Poll until shutdown.
    pub fn spawn(self: Arc<Self>) -> WorkerHandle
    where
        S: 'static,
        F: 'static,
        N: 'static,
    {
        WorkerHandle::spawn("dispatch", move |mut shutdown| async move {
            loop {
                let delay = match self.poll_once(Utc::now()).await {
                    Ok(DispatchPoll::Idle) => self.config.idle_delay,
                    Ok(_) => self.config.global_delay,
                    Err(err) => {
                        error!(error = %err, "dispatch poll failed");
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
