//! Worker messages and rich-text formatting entities.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{ChatId, SendRequestId, TenantId, WorkerMessageId};
use crate::publication::{Content, MediaRef};
use crate::request::SendRequest;
use crate::status::MessageStatus;

/// Abstract formatting kind produced by the authoring editor.
///
/// Kinds this build does not recognise survive deserialization as `Other` so
/// the delivery side can drop them with a warning instead of rejecting the
/// whole message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityKind {
    Bold,
    Italic,
    Underline,
    Strikethrough,
    Link,
    Blockquote,
    CustomEmoji,
    Other(String),
}

impl EntityKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Bold => "bold",
            Self::Italic => "italic",
            Self::Underline => "underline",
            Self::Strikethrough => "strikethrough",
            Self::Link => "text_link",
            Self::Blockquote => "blockquote",
            Self::CustomEmoji => "custom_emoji",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for EntityKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "bold" => Self::Bold,
            "italic" => Self::Italic,
            "underline" => Self::Underline,
            "strikethrough" => Self::Strikethrough,
            "text_link" | "link" => Self::Link,
            "blockquote" => Self::Blockquote,
            "custom_emoji" => Self::CustomEmoji,
            _ => Self::Other(value),
        }
    }
}

impl From<EntityKind> for String {
    fn from(value: EntityKind) -> Self {
        value.as_str().to_string()
    }
}

/// A formatting span. `offset` and `length` are UTF-16 code units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattingEntity {
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub offset: u32,
    pub length: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_emoji_id: Option<String>,
}

impl FormattingEntity {
    pub fn new(kind: EntityKind, offset: u32, length: u32) -> Self {
        Self {
            kind,
            offset,
            length,
            url: None,
            custom_emoji_id: None,
        }
    }

    pub fn link(offset: u32, length: u32, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::new(EntityKind::Link, offset, length)
        }
    }

    pub fn custom_emoji(offset: u32, length: u32, id: impl Into<String>) -> Self {
        Self {
            custom_emoji_id: Some(id.into()),
            ..Self::new(EntityKind::CustomEmoji, offset, length)
        }
    }
}

/// What a worker message asks the delivery process to do.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Send text (and optional media) into a chat.
    Post,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Post => "post",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post" => Ok(Self::Post),
            other => Err(DomainError::unsupported_kind(format!("message kind '{other}'"))),
        }
    }
}

/// The unit a tenant's delivery process actually transmits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMessage {
    pub id: WorkerMessageId,
    pub request_id: SendRequestId,
    pub tenant_id: TenantId,
    pub chat_id: ChatId,
    pub kind: MessageKind,
    pub text: String,
    pub entities: Vec<FormattingEntity>,
    pub media: Option<MediaRef>,
    pub status: MessageStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerMessage {
    /// Create a PENDING message for `request` carrying `content`.
    pub fn new(request: &SendRequest, kind: MessageKind, content: &Content) -> Self {
        let now = Utc::now();
        Self {
            id: WorkerMessageId::new(),
            request_id: request.id,
            tenant_id: request.tenant_id,
            chat_id: request.chat.id,
            kind,
            text: content.text.clone(),
            entities: content.entities.clone(),
            media: content.media.clone(),
            status: MessageStatus::Pending,
            attempts: 0,
            last_error: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_entity_kinds_survive_deserialization() {
        let json = r#"{"type":"spoiler","offset":0,"length":3}"#;
        let entity: FormattingEntity = serde_json::from_str(json).unwrap();
        assert_eq!(entity.kind, EntityKind::Other("spoiler".into()));
    }

    #[test]
    fn entity_serializes_with_wire_style_keys() {
        let entity = FormattingEntity::link(2, 4, "https://example.org");
        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value["type"], "text_link");
        assert_eq!(value["url"], "https://example.org");
        assert!(value.get("custom_emoji_id").is_none());
    }

    #[test]
    fn unknown_message_kind_is_a_typed_error() {
        let err = "story".parse::<MessageKind>().unwrap_err();
        assert!(matches!(err, DomainError::UnsupportedKind(_)));
    }
}
