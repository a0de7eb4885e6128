//! Messenger client seam and the Bot API implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use postline_core::{MediaKind, MediaRef, MessageKind, WorkerMessage};

use super::entities::{EntityError, to_wire};
use super::proxy::ProxySettings;
use crate::fleet::WorkerConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Worth retrying: connection trouble, timeouts, rate limits, server errors.
    #[error("transient send failure: {0}")]
    Transient(String),

    /// Retrying cannot help.
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }
}

impl From<EntityError> for SendError {
    fn from(err: EntityError) -> Self {
        SendError::Permanent(format!("invalid formatting: {err}"))
    }
}

/// Identifier the messenger assigned to a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SentMessage {
    pub message_id: i64,
}

#[async_trait]
pub trait MessengerClient: Send + Sync {
    /// Check that credentials and network path work.
    async fn probe(&self) -> Result<(), SendError>;

    async fn send(&self, message: &WorkerMessage) -> Result<SentMessage, SendError>;
}

#[async_trait]
impl<C> MessengerClient for Arc<C>
where
    C: MessengerClient + ?Sized,
{
    async fn probe(&self) -> Result<(), SendError> {
        (**self).probe().await
    }

    async fn send(&self, message: &WorkerMessage) -> Result<SentMessage, SendError> {
        (**self).send(message).await
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
}

/// Bot API client.
///
/// Every call builds a fresh HTTP client, so each attempt (and retry) uses a
/// new connection through the tenant's proxy.
#[derive(Debug, Clone)]
pub struct BotApiClient {
    base_url: String,
    token: Option<String>,
    proxy: Option<String>,
    media_base_url: Option<String>,
    timeout: Duration,
}

impl BotApiClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        proxy: Option<String>,
        media_base_url: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            token,
            proxy,
            media_base_url,
            timeout,
        }
    }

    pub fn from_worker_config(config: &WorkerConfig) -> Self {
        Self::new(
            config.bot_api_base_url.clone(),
            config.credentials.as_ref().map(|c| c.bot_token.clone()),
            config.proxy.clone(),
            config.media_base_url.clone(),
            config.delivery.request_timeout,
        )
    }

    fn token(&self) -> Result<&str, SendError> {
        self.token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SendError::Permanent("tenant has no credentials".into()))
    }

    fn api_url(&self, token: &str, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url.trim_end_matches('/'), token, method)
    }

    fn http(&self) -> Result<reqwest::Client, SendError> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(raw) = &self.proxy {
            builder = builder.proxy(ProxySettings::parse(raw)?.to_reqwest()?);
        }
        builder
            .build()
            .map_err(|e| SendError::Permanent(format!("http client: {e}")))
    }

    fn media_url(&self, media: &MediaRef) -> String {
        let location = media.location.as_str();
        if location.starts_with("http://") || location.starts_with("https://") {
            return location.to_string();
        }
        match &self.media_base_url {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                location.trim_start_matches('/')
            ),
            None => location.to_string(),
        }
    }

    /// Bot API method and JSON body for `message`.
    pub fn build_request(
        &self,
        message: &WorkerMessage,
    ) -> Result<(&'static str, serde_json::Value), SendError> {
        match message.kind {
            MessageKind::Post => {}
        }

        let entities = to_wire(&message.text, &message.entities)?;
        let Some(media) = &message.media else {
            return Ok((
                "sendMessage",
                json!({
                    "chat_id": message.chat_id.0,
                    "text": message.text,
                    "entities": entities,
                    "link_preview_options": { "is_disabled": true },
                }),
            ));
        };

        let (method, field) = match media.kind {
            MediaKind::Photo => ("sendPhoto", "photo"),
            MediaKind::Video => ("sendVideo", "video"),
            MediaKind::Document => ("sendDocument", "document"),
        };
        let mut body = json!({
            "chat_id": message.chat_id.0,
            "caption": message.text,
            "caption_entities": entities,
        });
        body[field] = json!(self.media_url(media));
        Ok((method, body))
    }

    async fn call<T>(&self, method: &str, body: Option<&serde_json::Value>) -> Result<T, SendError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let token = self.token()?;
        let http = self.http()?;
        let url = self.api_url(token, method);

        let request = match body {
            Some(body) => http.post(&url).json(body),
            None => http.get(&url),
        };
        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();

        let body: ApiResponse<T> = match response.json().await {
            Ok(body) => body,
            Err(err) if status.is_success() || is_retryable_status(status.as_u16()) => {
                return Err(SendError::Transient(format!("{method}: unreadable response: {err}")));
            }
            Err(_) => {
                return Err(SendError::Permanent(format!("{method}: HTTP {status}")));
            }
        };

        if body.ok {
            return body
                .result
                .ok_or_else(|| SendError::Transient(format!("{method}: empty result")));
        }

        let code = body.error_code.unwrap_or(status.as_u16());
        let description = body.description.unwrap_or_default();
        if is_retryable_status(code) {
            Err(SendError::Transient(format!("{method}: {code} {description}")))
        } else {
            Err(SendError::Permanent(format!("{method}: {code} {description}")))
        }
    }
}

fn is_retryable_status(code: u16) -> bool {
    code == 429 || (500..600).contains(&code)
}

fn classify_transport(err: reqwest::Error) -> SendError {
    if err.is_connect() || err.is_timeout() || err.is_body() || err.is_decode() {
        SendError::Transient(err.to_string())
    } else if err.is_builder() {
        SendError::Permanent(err.to_string())
    } else {
        // Requests cut off mid-flight.
        SendError::Transient(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct BotUser {
    id: i64,
}

#[async_trait]
impl MessengerClient for BotApiClient {
    async fn probe(&self) -> Result<(), SendError> {
        let me: BotUser = self.call("getMe", None).await?;
        debug!(bot_id = me.id, "messenger probe ok");
        Ok(())
    }

    async fn send(&self, message: &WorkerMessage) -> Result<SentMessage, SendError> {
        let (method, body) = self.build_request(message)?;
        self.call(method, Some(&body)).await
    }
}
