//! Delivery: the loop running inside each tenant's worker process.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod client;
pub mod consumer;
pub mod entities;
pub mod proxy;
pub mod retry;

pub use client::{BotApiClient, MessengerClient, SendError, SentMessage};
pub use consumer::{DeliveryConsumer, DeliveryExit, DeliveryPoll};
pub use entities::{EntityError, WireEntity, to_wire, utf16_len};
pub use proxy::ProxySettings;
pub use retry::{BackoffStrategy, RetryPolicy};

/// Tunables handed to the worker through its config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Sleep after an empty poll.
    pub idle_delay: Duration,
    /// Sleep after a poll that did work.
    pub global_delay: Duration,
    /// Consecutive empty polls before the worker exits.
    pub idle_polls_before_exit: u32,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            idle_delay: Duration::from_secs(60),
            global_delay: Duration::from_secs(1),
            idle_polls_before_exit: 2,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}
