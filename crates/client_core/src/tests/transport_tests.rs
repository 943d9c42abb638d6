use super::*;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::net::TcpListener;

async fn push_handler(ws: WebSocketUpgrade, headers: HeaderMap) -> impl IntoResponse {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("none")
        .to_string();
    ws.on_upgrade(move |socket| echo_session(socket, auth))
}

/// Greets with the caller's auth header, echoes text frames, closes on "bye".
async fn echo_session(mut socket: WebSocket, auth: String) {
    if socket.send(WsMessage::Text(auth)).await.is_err() {
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            WsMessage::Text(text) if text == "bye" => {
                let _ = socket.send(WsMessage::Close(None)).await;
                break;
            }
            WsMessage::Text(text) => {
                let _ = socket.send(WsMessage::Ping(Vec::new())).await;
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
}

async fn spawn_push_server() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route("/ws", get(push_handler));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Url::parse(&format!("ws://{addr}/ws")).expect("url")
}

#[tokio::test]
async fn websocket_connector_carries_token_and_text_frames() {
    let endpoint = spawn_push_server().await;
    let connector = WebSocketConnector::new(endpoint, Some("secret".into()));

    let mut stream = connector.connect().await.expect("connect");
    let greeting = stream.next_frame().await.expect("frame").expect("text");
    assert_eq!(greeting, "Bearer secret");

    stream
        .send_frame(r#"{"type":"CREATE","id":"1"}"#.into())
        .await
        .expect("send");
    let echoed = stream.next_frame().await.expect("frame").expect("text");
    assert_eq!(echoed, r#"{"type":"CREATE","id":"1"}"#);

    stream.send_frame("bye".into()).await.expect("send");
    assert!(stream.next_frame().await.is_none());
}

#[tokio::test]
async fn connector_without_token_sends_no_authorization() {
    let endpoint = spawn_push_server().await;
    let connector = WebSocketConnector::new(endpoint, None);

    let mut stream = connector.connect().await.expect("connect");
    assert_eq!(
        stream.next_frame().await.expect("frame").expect("text"),
        "none"
    );
    stream.close().await;
}

#[tokio::test]
async fn unreachable_endpoint_is_a_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let connector = WebSocketConnector::new(
        Url::parse(&format!("ws://{addr}/ws")).expect("url"),
        None,
    );
    match connector.connect().await {
        Err(TransportError::Connect(message)) => assert!(message.contains(&addr.to_string())),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("connected to a closed port"),
    }
}
