//! `BotApiClient` against a local fake of the Bot API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{Json, Router, extract::Extension, http::StatusCode, routing::get, routing::post};
use chrono::Utc;
use postline_core::{
    ChatTarget, Content, EntityKind, FormattingEntity, MessageKind, Publication, Schedule,
    SendRequest, TenantId, WorkerMessage,
};
use postline_infra::delivery::{BotApiClient, MessengerClient, SendError};
use serde_json::{Value, json};

type Captured = Arc<Mutex<Vec<Value>>>;

struct FakeBotApi {
    base_url: String,
    captured: Captured,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeBotApi {
    async fn spawn() -> Self {
        let captured: Captured = Arc::default();
        let app = Router::new()
            .route(
                "/bottest-token/getMe",
                get(|| async { Json(json!({ "ok": true, "result": { "id": 99 } })) }),
            )
            .route("/bottest-token/sendMessage", post(send_message))
            .route(
                "/bottest-token/sendPhoto",
                post(|| async {
                    (
                        StatusCode::TOO_MANY_REQUESTS,
                        Json(json!({
                            "ok": false,
                            "error_code": 429,
                            "description": "Too Many Requests: retry after 3"
                        })),
                    )
                }),
            )
            .route(
                "/bottest-token/sendDocument",
                post(|| async {
                    (
                        StatusCode::FORBIDDEN,
                        Json(json!({
                            "ok": false,
                            "error_code": 403,
                            "description": "Forbidden: bot was kicked from the group chat"
                        })),
                    )
                }),
            )
            .layer(Extension(captured.clone()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base_url,
            captured,
            handle,
        }
    }

    fn client(&self, token: &str) -> BotApiClient {
        BotApiClient::new(
            self.base_url.clone(),
            Some(token.to_string()),
            None,
            Some("https://cdn.example".to_string()),
            Duration::from_secs(5),
        )
    }
}

impl Drop for FakeBotApi {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn send_message(Extension(captured): Extension<Captured>, Json(body): Json<Value>) -> Json<Value> {
    captured.lock().unwrap().push(body);
    Json(json!({ "ok": true, "result": { "message_id": 1234 } }))
}

fn message(content: Content) -> WorkerMessage {
    let publication = Publication::new(
        TenantId::new(),
        content.clone(),
        Schedule::single(Utc::now()),
        vec![ChatTarget::new(-1001)],
    )
    .unwrap();
    let request = SendRequest::fan_out(&publication, Utc::now(), Utc::now()).remove(0);
    WorkerMessage::new(&request, MessageKind::Post, &content)
}

#[tokio::test]
async fn probe_and_send_text() {
    let api = FakeBotApi::spawn().await;
    let client = api.client("test-token");

    client.probe().await.unwrap();

    let mut content = Content::plain("Hi 🙂 there");
    content.entities = vec![
        FormattingEntity::new(EntityKind::Bold, 0, 2),
        FormattingEntity::link(6, 5, "https://example.com"),
    ];
    let sent = client.send(&message(content)).await.unwrap();
    assert_eq!(sent.message_id, 1234);

    let captured = api.captured.lock().unwrap();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0]["chat_id"], -1001);
    assert_eq!(captured[0]["entities"][1]["type"], "text_link");
    assert_eq!(captured[0]["entities"][1]["offset"], 6);
    assert_eq!(captured[0]["link_preview_options"]["is_disabled"], true);
}

#[tokio::test]
async fn rate_limit_is_transient_and_forbidden_is_permanent() {
    let api = FakeBotApi::spawn().await;
    let client = api.client("test-token");

    let mut photo = Content::plain("caption");
    photo.media = Some(postline_core::MediaRef {
        kind: postline_core::MediaKind::Photo,
        location: "a.jpg".into(),
    });
    let err = client.send(&message(photo)).await.unwrap_err();
    assert!(err.is_transient(), "{err}");

    let mut document = Content::plain("report");
    document.media = Some(postline_core::MediaRef {
        kind: postline_core::MediaKind::Document,
        location: "r.pdf".into(),
    });
    let err = client.send(&message(document)).await.unwrap_err();
    assert!(matches!(err, SendError::Permanent(ref m) if m.contains("kicked")));
}

#[tokio::test]
async fn wrong_token_is_permanent() {
    let api = FakeBotApi::spawn().await;
    // Unknown route: axum answers 404 without a Bot API body.
    let err = api.client("other-token").probe().await.unwrap_err();
    assert!(matches!(err, SendError::Permanent(_)));
}
