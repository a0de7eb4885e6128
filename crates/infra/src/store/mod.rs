//! Durable store: publications, send requests, worker messages and tenants.
//!
//! The store doubles as the work queue for every polling consumer, so each
//! `claim_*` method must be atomic: select the oldest candidate and move it
//! out of its queued status in one step. Two consumers racing for the same row
//! see exactly one winner; the loser gets the next row or `None`.
//!
//! Status writes are conditional. An update that would leave a terminal status
//! or move backwards in the working chain is refused and reported as `false`,
//! never as an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use postline_core::{
    CycleOutcome, Publication, PublicationId, PublicationStatus, RequestStatus, SendRequest,
    SendRequestId, Tenant, TenantId, WorkerMessage, WorkerMessageId,
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// A row carries a kind this build cannot handle. The row has already been
    /// claimed when this is returned, so the caller owns failing it.
    #[error("unsupported {entity} kind '{kind}' on {id}")]
    UnsupportedKind {
        entity: &'static str,
        id: String,
        kind: String,
    },

    #[error("undecodable row: {0}")]
    Decode(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Result of writing one fan-out cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleCreation {
    /// The requests were inserted.
    Created(usize),
    /// Requests for this (publication, cycle) already existed; nothing written.
    AlreadyExists(usize),
}

#[async_trait]
pub trait PublicationStore: Send + Sync {
    async fn insert_publication(&self, publication: &Publication) -> StoreResult<()>;

    async fn get_publication(&self, id: PublicationId) -> StoreResult<Option<Publication>>;

    /// Oldest PENDING publication, moved to SCHEDULING.
    async fn claim_pending_publication(&self) -> StoreResult<Option<Publication>>;

    /// Conditional status write; `false` when the transition is not allowed.
    async fn set_publication_status(
        &self,
        id: PublicationId,
        status: PublicationStatus,
    ) -> StoreResult<bool>;

    /// Store the aggregate outcome of one recurring cycle.
    async fn record_cycle_outcome(
        &self,
        id: PublicationId,
        outcome: CycleOutcome,
    ) -> StoreResult<()>;

    /// Publications in any of `statuses`, oldest first.
    async fn list_publications(
        &self,
        statuses: &[PublicationStatus],
    ) -> StoreResult<Vec<Publication>>;

    /// Set the soft-delete marker; `false` if it was already set.
    async fn soft_delete_publication(
        &self,
        id: PublicationId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;
}

#[async_trait]
pub trait SendRequestStore: Send + Sync {
    /// Atomically insert all requests of one fan-out cycle and, when given,
    /// move the publication to `publication_status`.
    ///
    /// Idempotent per (publication, cycle): a second call writes nothing.
    async fn create_cycle(
        &self,
        publication_id: PublicationId,
        cycle_at: DateTime<Utc>,
        requests: &[SendRequest],
        publication_status: Option<PublicationStatus>,
    ) -> StoreResult<CycleCreation>;

    async fn get_request(&self, id: SendRequestId) -> StoreResult<Option<SendRequest>>;

    /// Oldest PLANNED request, moved to IN_PROGRESS.
    async fn claim_planned_request(&self) -> StoreResult<Option<SendRequest>>;

    /// Conditional status write; `false` when the transition is not allowed.
    async fn set_request_status(
        &self,
        id: SendRequestId,
        status: RequestStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> StoreResult<bool>;

    async fn requests_for_cycle(
        &self,
        publication_id: PublicationId,
        cycle_at: DateTime<Utc>,
    ) -> StoreResult<Vec<SendRequest>>;

    async fn requests_for_publication(
        &self,
        publication_id: PublicationId,
    ) -> StoreResult<Vec<SendRequest>>;
}

#[async_trait]
pub trait WorkerMessageStore: Send + Sync {
    async fn insert_messages(&self, messages: &[WorkerMessage]) -> StoreResult<()>;

    async fn get_message(&self, id: WorkerMessageId) -> StoreResult<Option<WorkerMessage>>;

    /// Oldest PENDING message of `tenant_id`, moved to IN_PROGRESS with its
    /// attempt counter bumped.
    async fn claim_pending_message(&self, tenant_id: TenantId)
    -> StoreResult<Option<WorkerMessage>>;

    async fn mark_message_sent(&self, id: WorkerMessageId, at: DateTime<Utc>)
    -> StoreResult<bool>;

    async fn mark_message_failed(&self, id: WorkerMessageId, error: &str) -> StoreResult<bool>;

    /// Every message produced for `request_id`.
    async fn messages_for_request(
        &self,
        request_id: SendRequestId,
    ) -> StoreResult<Vec<WorkerMessage>>;
}

#[async_trait]
pub trait TenantRegistry: Send + Sync {
    async fn upsert_tenant(&self, tenant: &Tenant) -> StoreResult<()>;

    async fn get_tenant(&self, id: TenantId) -> StoreResult<Option<Tenant>>;
}

/// Everything the pipeline needs from durable storage.
pub trait Store:
    PublicationStore + SendRequestStore + WorkerMessageStore + TenantRegistry + 'static
{
}

impl<T> Store for T where
    T: PublicationStore + SendRequestStore + WorkerMessageStore + TenantRegistry + 'static
{
}
