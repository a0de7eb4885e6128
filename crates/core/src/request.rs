//! Per-destination send requests.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{PublicationId, SendRequestId, TenantId};
use crate::publication::{ChatTarget, Publication};
use crate::status::RequestStatus;

/// What kind of delivery a request stands for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Publish the publication's content into one chat.
    Post,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Post => "post",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post" => Ok(Self::Post),
            other => Err(DomainError::unsupported_kind(format!("request kind '{other}'"))),
        }
    }
}

/// Delivery obligation for one (publication, chat, cycle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub id: SendRequestId,
    pub publication_id: PublicationId,
    pub tenant_id: TenantId,
    pub chat: ChatTarget,
    pub kind: RequestKind,
    /// Scheduled instant of the occurrence that produced this request.
    pub cycle_at: DateTime<Utc>,
    pub status: RequestStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SendRequest {
    pub fn new(
        publication: &Publication,
        chat: ChatTarget,
        kind: RequestKind,
        cycle_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SendRequestId::new(),
            publication_id: publication.id,
            tenant_id: publication.tenant_id,
            chat,
            kind,
            cycle_at,
            status: RequestStatus::Planned,
            sent_at: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// One PLANNED request per destination chat of `publication`.
    pub fn fan_out(
        publication: &Publication,
        cycle_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<Self> {
        publication
            .chats
            .iter()
            .cloned()
            .map(|chat| Self::new(publication, chat, RequestKind::Post, cycle_at, now))
            .collect()
    }
}
