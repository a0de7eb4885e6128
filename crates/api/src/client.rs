//! Reports watch events to a remote watcher over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tracing::debug;

use postline_events::{NotifyError, StatusNotifier, WatchEvent};

use crate::app::{MESSAGE_PATH, REQUEST_STATUS_PATH};

#[derive(Debug, Clone)]
pub struct HttpWatcherClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpWatcherClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Unreachable(format!("http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl StatusNotifier for HttpWatcherClient {
    async fn notify(&self, event: WatchEvent) -> Result<(), NotifyError> {
        let (path, body) = match event {
            WatchEvent::MessageReported { message_id } => {
                (MESSAGE_PATH, json!({ "message_id": message_id }))
            }
            WatchEvent::RequestStatusChanged { request_id } => {
                (REQUEST_STATUS_PATH, json!({ "request_id": request_id }))
            }
        };

        let response = self
            .http
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(event = event.event_type(), "watcher accepted event");
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        match status {
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
                Err(NotifyError::Rejected(format!("{status}: {text}")))
            }
            _ => Err(NotifyError::Unreachable(format!("{status}: {text}"))),
        }
    }
}
