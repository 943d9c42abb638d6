use super::*;

use std::sync::Mutex;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use shared::{error::ErrorCode, EnvelopeKind};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Recorded {
    requests: Arc<Mutex<Vec<(String, Value)>>>,
}

impl Recorded {
    fn push(&self, label: impl Into<String>, body: Value) {
        self.requests
            .lock()
            .expect("recorded")
            .push((label.into(), body));
    }

    fn take(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut *self.requests.lock().expect("recorded"))
    }
}

fn bearer(headers: &HeaderMap) -> String {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn list_messages(
    State(recorded): State<Recorded>,
    Path(channel_id): Path<String>,
    Query(query): Query<std::collections::HashMap<String, String>>,
    headers: HeaderMap,
) -> Json<Value> {
    recorded.push(
        format!("GET {channel_id}"),
        json!({ "auth": bearer(&headers), "limit": query.get("limit") }),
    );
    Json(json!({
        "code": 200,
        "data": [
            { "id": 1, "sender_id": 7, "content": "first", "timestamp": "2024-05-01T10:00:00" },
            { "content": "no id" },
            { "id": 2, "sender_id": 8, "content": "", "file_url": "/f/2.png", "file_type": "image/png" },
        ],
    }))
}

async fn create_message(
    State(recorded): State<Recorded>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    recorded.push(format!("POST {channel_id} {}", bearer(&headers)), body);
    (
        StatusCode::CREATED,
        Json(json!({
            "code": 201,
            "status": "CREATED",
            "data": { "id": 55, "sender_id": 7, "content": "hi" },
        })),
    )
}

async fn upload_file(
    State(recorded): State<Recorded>,
    Query(query): Query<std::collections::HashMap<String, String>>,
    mut multipart: Multipart,
) -> (StatusCode, Json<Value>) {
    let mut fields = serde_json::Map::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let text = match file_name {
            Some(file_name) => {
                let bytes = field.bytes().await.unwrap_or_default();
                format!("{file_name}:{}", bytes.len())
            }
            None => field.text().await.unwrap_or_default(),
        };
        fields.insert(name, Value::String(text));
    }
    recorded.push(
        format!("UPLOAD {}", query.get("channelId").cloned().unwrap_or_default()),
        Value::Object(fields),
    );
    (
        StatusCode::CREATED,
        Json(json!({ "code": 201, "status": "CREATED" })),
    )
}

async fn edit_message(
    State(recorded): State<Recorded>,
    Path((channel_id, message_id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    recorded.push(format!("PUT {channel_id}/{message_id}"), body);
    Json(json!({ "code": 403, "status": "FORBIDDEN", "message": "not your message" }))
}

async fn delete_message(Path((_channel_id, _message_id)): Path<(String, String)>) -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "message not found" })))
}

async fn list_users() -> Json<Value> {
    Json(json!([
        { "id": 7, "name": "Ada", "email": "ada@example.com", "profilePicture": "/a.png" },
        { "name": "no id" },
    ]))
}

async fn list_channels() -> Json<Value> {
    Json(json!({ "channels": [
        { "id": 3, "name": "general", "type": "group" },
        { "id": 4, "name": "", "type": "direct", "recipient_id": 8 },
    ]}))
}

async fn spawn_api_server() -> (String, Recorded) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let recorded = Recorded::default();
    let app = Router::new()
        .route(
            "/channels/:id/messages",
            get(list_messages).post(create_message),
        )
        .route(
            "/channels/:id/messages/:message_id",
            put(edit_message).delete(delete_message),
        )
        .route("/channels/files", post(upload_file))
        .route("/channels", get(list_channels))
        .route("/users", get(list_users))
        .with_state(recorded.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/"), recorded)
}

fn api(base_url: &str) -> HttpMessagingApi {
    HttpMessagingApi::new(base_url, Arc::new(StaticToken("secret".into())))
}

#[test]
fn numeric_ids_strip_legacy_prefix() {
    assert_eq!(numeric_message_id("msg-123"), Some(123));
    assert_eq!(numeric_message_id("42"), Some(42));
    assert_eq!(numeric_message_id("local-7f3a"), None);
    assert_eq!(numeric_message_id(""), None);
}

#[tokio::test]
async fn fetch_messages_skips_malformed_records_and_fills_channel() {
    let (base_url, recorded) = spawn_api_server().await;
    let api = api(&base_url);
    assert!(!api.base_url().ends_with('/'));

    let messages = api
        .fetch_messages(&ChannelId::from("3"), 50)
        .await
        .expect("fetch");

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].kind, EnvelopeKind::Create);
    assert_eq!(messages[0].message_id.as_str(), "1");
    assert_eq!(messages[0].channel_id, Some(ChannelId::from("3")));
    assert!(messages[0].timestamp.is_some());
    assert!(messages[1].attachment.as_ref().expect("attachment").is_image());

    let requests = recorded.take();
    assert_eq!(requests[0].0, "GET 3");
    assert_eq!(requests[0].1["auth"], "Bearer secret");
    assert_eq!(requests[0].1["limit"], "50");
}

#[tokio::test]
async fn send_message_returns_stored_record() {
    let (base_url, recorded) = spawn_api_server().await;
    let request = SendMessageRequest {
        content: "hi".into(),
        recipient_id: None,
        thread_parent_id: Some(9),
    };

    let stored = api(&base_url)
        .send_message(&ChannelId::from("3"), &request)
        .await
        .expect("send")
        .expect("record echoed");

    assert_eq!(stored.message_id.as_str(), "55");
    assert_eq!(stored.channel_id, Some(ChannelId::from("3")));
    let requests = recorded.take();
    assert_eq!(requests[0].0, "POST 3 Bearer secret");
    assert_eq!(requests[0].1["content"], "hi");
    assert_eq!(requests[0].1["thread_parent_id"], 9);
}

#[tokio::test]
async fn send_file_posts_multipart_form() {
    let (base_url, recorded) = spawn_api_server().await;
    let upload = FileUpload {
        file_name: "notes.txt".into(),
        mime_type: "text/plain".into(),
        bytes: b"hello".to_vec(),
        content: "see attached".into(),
        thread_parent_id: None,
    };

    let stored = api(&base_url)
        .send_file(&ChannelId::from("3"), &upload)
        .await
        .expect("upload");

    assert!(stored.is_none());
    let requests = recorded.take();
    assert_eq!(requests[0].0, "UPLOAD 3");
    assert_eq!(requests[0].1["files"], "notes.txt:5");
    assert_eq!(requests[0].1["content"], "see attached");
    assert!(requests[0].1.get("thread_parent_id").is_none());
}

#[tokio::test]
async fn error_code_inside_ok_response_is_a_rejection() {
    let (base_url, recorded) = spawn_api_server().await;
    let request = EditMessageRequest {
        channel_id: Some(3),
        recipient_id: None,
        content: "edited".into(),
    };

    let err = api(&base_url)
        .edit_message(&ChannelId::from("3"), 55, &request)
        .await
        .expect_err("rejected");

    match err {
        SendError::Rejected { source, .. } => {
            assert_eq!(source.code, ErrorCode::Forbidden);
            assert_eq!(source.message, "not your message");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(recorded.take()[0].0, "PUT 3/55");
}

#[tokio::test]
async fn http_error_status_is_decoded() {
    let (base_url, _recorded) = spawn_api_server().await;
    let err = api(&base_url)
        .delete_message(&ChannelId::from("3"), 55)
        .await
        .expect_err("not found");

    match err {
        SendError::Rejected { source, .. } => {
            assert_eq!(source.status, 404);
            assert_eq!(source.message, "message not found");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn directory_and_channel_lists_tolerate_body_shapes() {
    let (base_url, _recorded) = spawn_api_server().await;
    let api = api(&base_url);

    let users = api.fetch_users().await.expect("users");
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].name, "Ada");
    assert_eq!(users[0].avatar.as_deref(), Some("/a.png"));

    let channels = api.fetch_channels().await.expect("channels");
    assert_eq!(channels.len(), 2);
    assert_eq!(channels[1].recipient_id.as_ref().map(|id| id.as_str()), Some("8"));
}

#[tokio::test]
async fn missing_token_fails_before_any_request() {
    let (base_url, recorded) = spawn_api_server().await;
    let api = HttpMessagingApi::new(&base_url, Arc::new(StaticToken("  ".into())));

    assert!(matches!(
        api.fetch_messages(&ChannelId::from("3"), 10).await,
        Err(FetchError::NotSignedIn)
    ));
    assert!(matches!(
        api.delete_message(&ChannelId::from("3"), 1).await,
        Err(SendError::NotSignedIn)
    ));
    assert!(recorded.take().is_empty());
}
