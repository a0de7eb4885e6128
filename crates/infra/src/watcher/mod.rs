//! Status watcher: turns child completion into parent status.
//!
//! Every event is evaluated from the current store state, so duplicated or
//! reordered events converge on the same result.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use postline_core::{
    CycleOutcome, PublicationStatus, RequestStatus, SendRequest, SendRequestId, Status,
    WorkerMessageId, aggregate_publication, aggregate_request,
};
use postline_events::{NotifyError, StatusNotifier, WatchEvent};

use crate::store::{Store, StoreError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// The reported entity is not in a state that can be reported.
    #[error("invalid report: {0}")]
    InvalidReport(String),

    /// The report was already applied.
    #[error("duplicate report: {0}")]
    Duplicate(String),
}

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Reconciliation {
    Applied {
        /// New request status, when the event settled the request.
        request_status: Option<RequestStatus>,
        /// New publication status, when the event settled a single publication.
        publication_status: Option<PublicationStatus>,
        /// Recorded outcome, when the event settled a daily cycle.
        cycle: Option<CycleOutcome>,
    },
    /// Storage failed; a later event re-evaluates from scratch.
    Deferred { reason: String },
}

impl Reconciliation {
    fn unchanged() -> Self {
        Reconciliation::Applied {
            request_status: None,
            publication_status: None,
            cycle: None,
        }
    }
}

enum Failure {
    Rejected(WatchError),
    Store(StoreError),
}

impl From<WatchError> for Failure {
    fn from(err: WatchError) -> Self {
        Failure::Rejected(err)
    }
}

impl From<StoreError> for Failure {
    fn from(err: StoreError) -> Self {
        Failure::Store(err)
    }
}

fn not_found(entity: &'static str, id: impl ToString) -> WatchError {
    WatchError::NotFound {
        entity,
        id: id.to_string(),
    }
}

pub struct Watcher<S> {
    store: Arc<S>,
}

impl<S: Store> Watcher<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    #[instrument(skip(self), fields(event_type = event.event_type()))]
    pub async fn handle(&self, event: WatchEvent) -> Result<Reconciliation, WatchError> {
        let result = match event {
            WatchEvent::MessageReported { message_id } => self.on_message(message_id).await,
            WatchEvent::RequestStatusChanged { request_id } => self.on_request(request_id).await,
        };

        match result {
            Ok(reconciliation) => Ok(reconciliation),
            Err(Failure::Rejected(err)) => {
                debug!(error = %err, "report rejected");
                Err(err)
            }
            Err(Failure::Store(err)) => {
                error!(error = %err, "reconciliation deferred");
                Ok(Reconciliation::Deferred {
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn on_message(&self, id: WorkerMessageId) -> Result<Reconciliation, Failure> {
        let message = self
            .store
            .get_message(id)
            .await?
            .ok_or_else(|| not_found("message", id))?;
        if !message.status.is_terminal() {
            return Err(WatchError::InvalidReport(format!(
                "message {id} is still {}",
                message.status
            ))
            .into());
        }

        let request = self
            .store
            .get_request(message.request_id)
            .await?
            .ok_or_else(|| not_found("request", message.request_id))?;
        if request.status.is_terminal() {
            // Settle the parent anyway in case an earlier pass was deferred.
            match self.reevaluate(&request).await {
                Ok(_) => {}
                Err(Failure::Store(err)) => {
                    warn!(request_id = %request.id, error = %err, "re-evaluation on duplicate deferred")
                }
                Err(Failure::Rejected(err)) => {
                    warn!(request_id = %request.id, error = %err, "re-evaluation on duplicate rejected")
                }
            }
            return Err(WatchError::Duplicate(format!(
                "request {} already {}",
                request.id, request.status
            ))
            .into());
        }

        let statuses: Vec<_> = self
            .store
            .messages_for_request(request.id)
            .await?
            .iter()
            .map(|m| m.status)
            .collect();
        let Some(status) = aggregate_request(&statuses) else {
            return Ok(Reconciliation::unchanged());
        };

        let sent_at = (status == RequestStatus::Sent).then(Utc::now);
        let changed = self
            .store
            .set_request_status(request.id, status, sent_at)
            .await?;
        if changed {
            info!(request_id = %request.id, status = %status, "request settled");
        }

        let (publication_status, cycle) = self.reevaluate(&request).await?;
        Ok(Reconciliation::Applied {
            request_status: changed.then_some(status),
            publication_status,
            cycle,
        })
    }

    async fn on_request(&self, id: SendRequestId) -> Result<Reconciliation, Failure> {
        let request = self
            .store
            .get_request(id)
            .await?
            .ok_or_else(|| not_found("request", id))?;
        let (publication_status, cycle) = self.reevaluate(&request).await?;
        Ok(Reconciliation::Applied {
            request_status: None,
            publication_status,
            cycle,
        })
    }

    /// Re-aggregate the cycle `request` belongs to.
    async fn reevaluate(
        &self,
        request: &SendRequest,
    ) -> Result<(Option<PublicationStatus>, Option<CycleOutcome>), Failure> {
        let publication = self
            .store
            .get_publication(request.publication_id)
            .await?
            .ok_or_else(|| not_found("publication", request.publication_id))?;

        let statuses: Vec<_> = self
            .store
            .requests_for_cycle(publication.id, request.cycle_at)
            .await?
            .iter()
            .map(|r| r.status)
            .collect();
        let Some(status) = aggregate_publication(&statuses) else {
            return Ok((None, None));
        };

        // A recurring publication lives on; only the cycle is settled.
        if publication.is_recurring() {
            let outcome = CycleOutcome {
                cycle_at: request.cycle_at,
                status,
            };
            self.store
                .record_cycle_outcome(publication.id, outcome)
                .await?;
            info!(publication_id = %publication.id, cycle_at = %outcome.cycle_at, status = %status, "cycle settled");
            return Ok((None, Some(outcome)));
        }

        let changed = self
            .store
            .set_publication_status(publication.id, status)
            .await?;
        if changed {
            info!(publication_id = %publication.id, status = %status, "publication settled");
        }
        Ok((changed.then_some(status), None))
    }
}

/// Lets in-process stages report straight to the watcher.
#[async_trait]
impl<S: Store> StatusNotifier for Watcher<S> {
    async fn notify(&self, event: WatchEvent) -> Result<(), NotifyError> {
        self.handle(event)
            .await
            .map(|_| ())
            .map_err(|err| NotifyError::Rejected(err.to_string()))
    }
}
