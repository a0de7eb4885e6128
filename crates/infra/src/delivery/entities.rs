//! Translation of formatting entities to the Bot API wire form.
//!
//! Offsets and lengths are UTF-16 code units, counted against the text that
//! is actually sent (the caption when media is attached).

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use postline_core::{EntityKind, FormattingEntity};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityError {
    #[error("entity #{index} ({kind}) has zero length")]
    ZeroLength { index: usize, kind: String },

    #[error("entity #{index} ({kind}) at {offset}+{length} exceeds text length {text_len}")]
    OutOfBounds {
        index: usize,
        kind: String,
        offset: u32,
        length: u32,
        text_len: u32,
    },

    #[error("text_link entity #{index} has no url")]
    MissingUrl { index: usize },

    #[error("custom_emoji entity #{index} has no custom_emoji_id")]
    MissingEmojiId { index: usize },
}

/// An entity as the Bot API expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WireEntity {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub offset: u32,
    pub length: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_emoji_id: Option<String>,
}

/// Length of `text` in UTF-16 code units.
pub fn utf16_len(text: &str) -> u32 {
    u32::try_from(text.encode_utf16().count()).unwrap_or(u32::MAX)
}

fn wire_kind(kind: &EntityKind) -> Option<&'static str> {
    match kind {
        EntityKind::Bold => Some("bold"),
        EntityKind::Italic => Some("italic"),
        EntityKind::Underline => Some("underline"),
        EntityKind::Strikethrough => Some("strikethrough"),
        EntityKind::Link => Some("text_link"),
        EntityKind::Blockquote => Some("blockquote"),
        EntityKind::CustomEmoji => Some("custom_emoji"),
        EntityKind::Other(_) => None,
    }
}

/// Validate `entities` against `text` and convert them.
///
/// Unknown kinds are dropped with a warning; any malformed known entity
/// rejects the whole message.
pub fn to_wire(text: &str, entities: &[FormattingEntity]) -> Result<Vec<WireEntity>, EntityError> {
    let text_len = utf16_len(text);
    let mut out = Vec::with_capacity(entities.len());

    for (index, entity) in entities.iter().enumerate() {
        let Some(kind) = wire_kind(&entity.kind) else {
            warn!(kind = entity.kind.as_str(), index, "dropping unsupported entity");
            continue;
        };

        if entity.length == 0 {
            return Err(EntityError::ZeroLength {
                index,
                kind: kind.to_string(),
            });
        }
        let end = u64::from(entity.offset) + u64::from(entity.length);
        if end > u64::from(text_len) {
            return Err(EntityError::OutOfBounds {
                index,
                kind: kind.to_string(),
                offset: entity.offset,
                length: entity.length,
                text_len,
            });
        }

        let (url, custom_emoji_id) = match entity.kind {
            EntityKind::Link => {
                let url = entity
                    .url
                    .clone()
                    .filter(|u| !u.is_empty())
                    .ok_or(EntityError::MissingUrl { index })?;
                (Some(url), None)
            }
            EntityKind::CustomEmoji => {
                let id = entity
                    .custom_emoji_id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .ok_or(EntityError::MissingEmojiId { index })?;
                (None, Some(id))
            }
            _ => (None, None),
        };

        out.push(WireEntity {
            kind,
            offset: entity.offset,
            length: entity.length,
            url,
            custom_emoji_id,
        });
    }

    Ok(out)
}
