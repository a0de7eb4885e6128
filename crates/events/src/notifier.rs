//! Notification seam between pipeline stages and the status watcher.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::event::{WatchEnvelope, WatchEvent};

#[derive(Debug, Error)]
pub enum NotifyError {
    /// The watcher could not be reached.
    #[error("watcher unreachable: {0}")]
    Unreachable(String),

    /// The watcher received the event and refused it (duplicate or invalid).
    #[error("watcher rejected event: {0}")]
    Rejected(String),
}

/// Sink for watch events.
///
/// Senders treat notification as best effort: a lost event is repaired by the
/// next event touching the same publication.
#[async_trait]
pub trait StatusNotifier: Send + Sync {
    async fn notify(&self, event: WatchEvent) -> Result<(), NotifyError>;
}

#[async_trait]
impl<N> StatusNotifier for Arc<N>
where
    N: StatusNotifier + ?Sized,
{
    async fn notify(&self, event: WatchEvent) -> Result<(), NotifyError> {
        (**self).notify(event).await
    }
}

/// Records every event; for tests and local wiring.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    inner: Mutex<Vec<WatchEnvelope>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WatchEvent> {
        self.inner
            .lock()
            .map(|guard| guard.iter().map(|e| e.event).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StatusNotifier for InMemoryNotifier {
    async fn notify(&self, event: WatchEvent) -> Result<(), NotifyError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| NotifyError::Unreachable("notifier lock poisoned".into()))?;
        guard.push(WatchEnvelope::now(event));
        Ok(())
    }
}

/// Logs and discards events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl StatusNotifier for NoopNotifier {
    async fn notify(&self, event: WatchEvent) -> Result<(), NotifyError> {
        tracing::debug!(event = event.event_type(), "watch event discarded");
        Ok(())
    }
}
