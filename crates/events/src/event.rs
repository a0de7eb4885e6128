//! Watch events: notifications that drive bottom-up reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use postline_core::{SendRequestId, WorkerMessageId};

/// A notification for the status watcher.
///
/// Events carry ids only. The watcher always re-reads current state, so the
/// same event may be delivered more than once or out of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEvent {
    /// A worker message reached a terminal delivery outcome.
    MessageReported { message_id: WorkerMessageId },
    /// A send request changed status outside of delivery (e.g. STALE at dispatch).
    RequestStatusChanged { request_id: SendRequestId },
}

impl WatchEvent {
    pub fn message(message_id: WorkerMessageId) -> Self {
        Self::MessageReported { message_id }
    }

    pub fn request(request_id: SendRequestId) -> Self {
        Self::RequestStatusChanged { request_id }
    }

    /// Stable event name used in logs.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageReported { .. } => "watch.message_reported",
            Self::RequestStatusChanged { .. } => "watch.request_status_changed",
        }
    }
}

/// A watch event stamped with the time it was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEnvelope {
    pub event: WatchEvent,
    pub emitted_at: DateTime<Utc>,
}

impl WatchEnvelope {
    pub fn now(event: WatchEvent) -> Self {
        Self {
            event,
            emitted_at: Utc::now(),
        }
    }
}
