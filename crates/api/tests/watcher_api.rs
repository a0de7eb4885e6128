use std::sync::Arc;

use chrono::Utc;
use postline_api::client::HttpWatcherClient;
use postline_core::{
    ChatTarget, Content, MessageKind, MessageStatus, Publication, PublicationStatus,
    RequestStatus, Schedule, SendRequest, SendRequestId, TenantId, WorkerMessage,
};
use postline_events::{NotifyError, StatusNotifier, WatchEvent};
use postline_infra::store::{InMemoryStore, PublicationStore, SendRequestStore, WorkerMessageStore};
use postline_infra::watcher::Watcher;
use reqwest::StatusCode;
use serde_json::json;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(store: Arc<InMemoryStore>) -> Self {
        // Same router as prod, bound to an ephemeral port.
        let app = postline_api::app::build_app(Arc::new(Watcher::new(store)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A single publication with one delivered message per chat.
async fn delivered_publication(store: &InMemoryStore, chats: i64) -> (Publication, Vec<WorkerMessage>) {
    let publication = Publication::new(
        TenantId::new(),
        Content::plain("hello"),
        Schedule::single(Utc::now()),
        (1..=chats).map(ChatTarget::new).collect(),
    )
    .unwrap();
    store.insert_publication(&publication).await.unwrap();

    let mut requests = SendRequest::fan_out(&publication, Utc::now(), Utc::now());
    for request in &mut requests {
        request.status = RequestStatus::InProgress;
    }
    store
        .create_cycle(
            publication.id,
            requests[0].cycle_at,
            &requests,
            Some(PublicationStatus::InProgress),
        )
        .await
        .unwrap();

    let messages: Vec<_> = requests
        .iter()
        .map(|r| {
            let mut m = WorkerMessage::new(r, MessageKind::Post, &publication.content);
            m.status = MessageStatus::Sent;
            m
        })
        .collect();
    store.insert_messages(&messages).await.unwrap();
    (publication, messages)
}

#[tokio::test]
async fn health_endpoint_is_up() {
    let server = TestServer::spawn(Arc::new(InMemoryStore::new())).await;
    let res = reqwest::get(format!("{}/health", server.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn message_reports_settle_the_publication_over_http() {
    let store = Arc::new(InMemoryStore::new());
    let (publication, messages) = delivered_publication(&store, 2).await;
    let server = TestServer::spawn(store.clone()).await;
    let client = reqwest::Client::new();
    let url = format!("{}/watch/message", server.base_url);

    let first: serde_json::Value = client
        .post(&url)
        .json(&json!({ "message_id": messages[0].id }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["outcome"], "applied");
    assert_eq!(first["request_status"], "sent");
    assert!(first["publication_status"].is_null());

    let res = client
        .post(&url)
        .json(&json!({ "message_id": messages[1].id }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let second: serde_json::Value = res.json().await.unwrap();
    assert_eq!(second["publication_status"], "posted");

    let stored = store.get_publication(publication.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PublicationStatus::Posted);

    // A repeated report is refused with the error envelope.
    let res = client
        .post(&url)
        .json(&json!({ "message_id": messages[1].id }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "duplicate");
    assert!(body["message"].as_str().unwrap().contains("already sent"));
}

#[tokio::test]
async fn unknown_request_is_404() {
    let server = TestServer::spawn(Arc::new(InMemoryStore::new())).await;
    let res = reqwest::Client::new()
        .post(format!("{}/watch/request-status", server.base_url))
        .json(&json!({ "request_id": SendRequestId::new() }))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn http_client_maps_watcher_answers() {
    let store = Arc::new(InMemoryStore::new());
    let (_, messages) = delivered_publication(&store, 1).await;
    let server = TestServer::spawn(store).await;
    let notifier =
        HttpWatcherClient::new(&server.base_url, std::time::Duration::from_secs(5)).unwrap();
    let event = WatchEvent::message(messages[0].id);

    notifier.notify(event).await.unwrap();
    let err = notifier.notify(event).await.unwrap_err();
    assert!(matches!(err, NotifyError::Rejected(_)));
}

#[tokio::test]
async fn http_client_reports_unreachable_watcher() {
    // Grab a free port and close it again.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let notifier =
        HttpWatcherClient::new(format!("http://{addr}"), std::time::Duration::from_secs(1))
            .unwrap();
    let err = notifier
        .notify(WatchEvent::request(SendRequestId::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::Unreachable(_)));
}
