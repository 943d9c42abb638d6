use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;

use crate::error::TransportError;

/// An established push connection carrying one JSON document per text frame.
#[async_trait]
pub trait PushStream: Send {
    /// `None` once the peer closed the connection.
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>>;
    async fn send_frame(&mut self, frame: String) -> Result<(), TransportError>;
    async fn close(&mut self);
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PushStream>, TransportError>;
}

pub struct WebSocketConnector {
    endpoint: Url,
    bearer_token: Option<String>,
}

impl WebSocketConnector {
    pub fn new(endpoint: Url, bearer_token: Option<String>) -> Self {
        Self {
            endpoint,
            bearer_token,
        }
    }
}

#[async_trait]
impl PushConnector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn PushStream>, TransportError> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        if let Some(token) = &self.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| TransportError::Connect(format!("invalid bearer token: {err}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(request)
            .await
            .map_err(|err| TransportError::Connect(format!("{}: {err}", self.endpoint)))?;
        debug!(endpoint = %self.endpoint, "push websocket established");
        Ok(Box::new(WebSocketPushStream { inner: stream }))
    }
}

struct WebSocketPushStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushStream for WebSocketPushStream {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(err) => return Some(Err(TransportError::Read(err.to_string()))),
            }
        }
    }

    async fn send_frame(&mut self, frame: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(frame))
            .await
            .map_err(|err| TransportError::Write(err.to_string()))
    }

    async fn close(&mut self) {
        if let Err(err) = self.inner.close(None).await {
            debug!("push websocket close failed: {err}");
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
