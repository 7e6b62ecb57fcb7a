//! Client harness for the Flare relay. Logs in over HTTP, opens the chat
//! websocket with the issued session token, and speaks the same JSON frames
//! the browser client does. Integration tests drive the server through it.

use flare_core::{ChatMessage, InboundFrame};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "flare_session";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("session token cannot be sent as a header")]
    InvalidToken,
}

/// What `POST /login` hands back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginGrant {
    pub identity: String,
    pub token: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[derive(Serialize)]
struct Credentials<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct CheckResponse {
    identity: String,
}

#[derive(Debug, Clone)]
pub struct FlareClient {
    http: reqwest::Client,
    base_url: String,
}

impl FlareClient {
    /// `base_url` is the server's HTTP origin, e.g. `http://127.0.0.1:8080`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/register", self.base_url))
            .json(&Credentials { username, password })
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginGrant, ClientError> {
        let response = self
            .http
            .post(format!("{}/login", self.base_url))
            .json(&Credentials { username, password })
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    /// Registers if needed, then logs in.
    pub async fn sign_in(&self, username: &str, password: &str) -> Result<LoginGrant, ClientError> {
        match self.register(username, password).await {
            Ok(()) | Err(ClientError::Status { status: 409, .. }) => {}
            Err(err) => return Err(err),
        }
        self.login(username, password).await
    }

    /// Identity behind `token`, as the server sees it.
    pub async fn check(&self, token: Uuid) -> Result<String, ClientError> {
        let response = self
            .http
            .get(format!("{}/login/check", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;
        let body: CheckResponse = ensure_success(response).await?.json().await?;
        Ok(body.identity)
    }

    pub async fn recent_alerts(
        &self,
        token: Uuid,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ClientError> {
        let response = self
            .http
            .get(format!("{}/alerts", self.base_url))
            .query(&[("limit", limit)])
            .bearer_auth(token)
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    /// Opens the chat websocket, presenting `token` as the session cookie.
    pub async fn connect(&self, token: Uuid) -> Result<ChatConnection, ClientError> {
        let mut request = format!("{}/ws", websocket_origin(&self.base_url)?).into_client_request()?;
        let cookie = HeaderValue::from_str(&format!("{SESSION_COOKIE}={token}"))
            .map_err(|_| ClientError::InvalidToken)?;
        request.headers_mut().insert(header::COOKIE, cookie);

        let (stream, _) = connect_async(request).await?;
        Ok(ChatConnection { stream })
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

fn websocket_origin(base_url: &str) -> Result<String, ClientError> {
    if let Some(rest) = base_url.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else if let Some(rest) = base_url.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if base_url.starts_with("ws://") || base_url.starts_with("wss://") {
        Ok(base_url.to_string())
    } else {
        Err(ClientError::InvalidUrl(base_url.to_string()))
    }
}

/// An open chat websocket.
pub struct ChatConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl ChatConnection {
    pub async fn send(&mut self, frame: &InboundFrame) -> Result<(), ClientError> {
        let payload = serde_json::to_string(frame)?;
        self.stream.send(Message::Text(payload)).await?;
        Ok(())
    }

    pub async fn send_message(&mut self, body: &str) -> Result<(), ClientError> {
        self.send(&InboundFrame::ordinary(body)).await
    }

    pub async fn send_distress(&mut self, body: &str) -> Result<(), ClientError> {
        self.send(&InboundFrame::distress(body)).await
    }

    /// Sends raw text, bypassing frame encoding.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), ClientError> {
        self.stream.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// Next relayed message, or `None` once the server closes the socket.
    pub async fn next_message(&mut self) -> Result<Option<ChatMessage>, ClientError> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                Message::Text(text) => return Ok(Some(serde_json::from_str(&text)?)),
                Message::Binary(bytes) => return Ok(Some(serde_json::from_slice(&bytes)?)),
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
        Ok(None)
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.close(None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn websocket_origin_follows_http_scheme() {
        assert_eq!(
            websocket_origin("http://127.0.0.1:8080").unwrap(),
            "ws://127.0.0.1:8080"
        );
        assert_eq!(
            websocket_origin("https://flare.example").unwrap(),
            "wss://flare.example"
        );
        assert_eq!(websocket_origin("ws://host:1").unwrap(), "ws://host:1");
        assert!(matches!(
            websocket_origin("flare.example"),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test_timeout::timeout]
    fn trailing_slash_is_dropped() {
        let client = FlareClient::new("http://127.0.0.1:8080/");
        assert_eq!(client.base_url(), "http://127.0.0.1:8080");
    }

    #[test_timeout::timeout]
    fn login_grant_parses_server_shape() {
        let grant: LoginGrant = serde_json::from_str(
            r#"{"identity":"alice","token":"6f1c2a52-8a43-4c3f-9a8e-0d3f1b8f7e21","expires_at":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(grant.identity, "alice");
        assert_eq!(grant.expires_at.year(), 2026);
    }
}
