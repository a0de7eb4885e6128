//! Fan-out stage: PENDING publications become scheduler jobs, and fired jobs
//! become one send request per destination chat.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use postline_core::PublicationId;

pub mod consumer;
pub mod job;

pub use consumer::{BootstrapReport, FanoutConsumer, FanoutPoll};
pub use job::FanoutJob;

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Sleep when there is nothing to claim.
    pub idle_delay: Duration,
    /// Sleep between iterations that did work.
    pub global_delay: Duration,
    /// How overdue a single publication may be at startup and still be sent.
    pub bootstrap_grace: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            idle_delay: Duration::from_secs(10),
            global_delay: Duration::from_secs(10),
            bootstrap_grace: Duration::from_secs(60 * 60),
        }
    }
}

/// Scheduler job payload for a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutPayload {
    pub publication_id: PublicationId,
}

impl FanoutPayload {
    pub fn to_value(self) -> serde_json::Value {
        serde_json::json!({ "publication_id": self.publication_id })
    }

    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}
