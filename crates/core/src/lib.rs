//! `postline-core`: domain types of the publication pipeline.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the three status state machines, the entity records that flow
//! between stages, and the aggregation rules the watcher applies.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod message;
pub mod publication;
pub mod request;
pub mod status;
pub mod tenant;

pub use aggregate::{aggregate_publication, aggregate_request};
pub use error::{DomainError, DomainResult};
pub use id::{ChatId, PublicationId, SendRequestId, TenantId, WorkerMessageId};
pub use message::{EntityKind, FormattingEntity, MessageKind, WorkerMessage};
pub use publication::{
    ChatTarget, Content, CycleOutcome, MediaKind, MediaRef, Publication, PublicationTemplate,
    Schedule, next_daily_at,
};
pub use request::{RequestKind, SendRequest};
pub use status::{MessageStatus, PublicationStatus, RequestStatus, Status};
pub use tenant::{Tenant, TenantCredentials};
