//! Publication: content, schedule and destination set.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};
use crate::id::{ChatId, PublicationId, TenantId};
use crate::message::FormattingEntity;
use crate::status::PublicationStatus;

/// Kind of attached media.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
}

/// Reference to media stored elsewhere (absolute URL or storage-relative path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub location: String,
}

/// Text, formatting and optional media of a publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub text: String,
    #[serde(default)]
    pub entities: Vec<FormattingEntity>,
    #[serde(default)]
    pub media: Option<MediaRef>,
}

impl Content {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            entities: Vec::new(),
            media: None,
        }
    }
}

/// Mutable authoring-side template a publication is cloned from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationTemplate {
    pub id: Uuid,
    pub content: Content,
}

/// A destination chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatTarget {
    pub id: ChatId,
    #[serde(default)]
    pub title: Option<String>,
}

impl ChatTarget {
    pub fn new(id: i64) -> Self {
        Self {
            id: ChatId(id),
            title: None,
        }
    }
}

/// When a publication fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire once at an instant.
    Single { at: DateTime<Utc> },
    /// Fire every day at `hour:minute` UTC.
    Daily { hour: u8, minute: u8 },
}

impl Schedule {
    pub fn single(at: DateTime<Utc>) -> Self {
        Self::Single { at }
    }

    pub fn daily(hour: u8, minute: u8) -> DomainResult<Self> {
        if hour > 23 || minute > 59 {
            return Err(DomainError::validation(format!(
                "daily time {hour:02}:{minute:02} is out of range"
            )));
        }
        Ok(Self::Daily { hour, minute })
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, Self::Daily { .. })
    }
}

/// Next `hour:minute` UTC strictly after `after`: today if not yet passed,
/// otherwise tomorrow.
pub fn next_daily_at(hour: u8, minute: u8, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(u32::from(hour), u32::from(minute), 0)?;
    let today = after.date_naive().and_time(time).and_utc();
    if today > after {
        Some(today)
    } else {
        Some(today + Duration::days(1))
    }
}

/// Aggregate outcome of one fan-out cycle of a recurring publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub cycle_at: DateTime<Utc>,
    pub status: PublicationStatus,
}

/// A scheduled content-delivery job targeting one or more chats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub id: PublicationId,
    pub tenant_id: TenantId,
    pub creator_id: Option<Uuid>,
    /// Template the content was copied from, if any.
    #[serde(default)]
    pub template_id: Option<Uuid>,
    pub content: Content,
    pub schedule: Schedule,
    pub chats: Vec<ChatTarget>,
    pub status: PublicationStatus,
    pub last_cycle: Option<CycleOutcome>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Publication {
    /// Create a PENDING publication.
    ///
    /// Duplicate destination chats are collapsed; an empty destination set is
    /// rejected.
    pub fn new(
        tenant_id: TenantId,
        content: Content,
        schedule: Schedule,
        chats: Vec<ChatTarget>,
    ) -> DomainResult<Self> {
        let mut unique: Vec<ChatTarget> = Vec::with_capacity(chats.len());
        for chat in chats {
            if !unique.iter().any(|c| c.id == chat.id) {
                unique.push(chat);
            }
        }
        if unique.is_empty() {
            return Err(DomainError::validation("publication needs at least one chat"));
        }

        let now = Utc::now();
        Ok(Self {
            id: PublicationId::new(),
            tenant_id,
            creator_id: None,
            template_id: None,
            content,
            schedule,
            chats: unique,
            status: PublicationStatus::Pending,
            last_cycle: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Create a publication from a snapshot of `template`'s content.
    ///
    /// Later edits to the template do not reach the publication.
    pub fn from_template(
        template: &PublicationTemplate,
        tenant_id: TenantId,
        schedule: Schedule,
        chats: Vec<ChatTarget>,
    ) -> DomainResult<Self> {
        let mut publication = Self::new(tenant_id, template.content.clone(), schedule, chats)?;
        publication.template_id = Some(template.id);
        Ok(publication)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_recurring(&self) -> bool {
        self.schedule.is_recurring()
    }

    /// Scheduler job id for this publication.
    pub fn job_id(&self) -> String {
        match self.schedule {
            Schedule::Single { .. } => format!("post_{}", self.id),
            Schedule::Daily { .. } => format!("post_daily_{}", self.id),
        }
    }
}
