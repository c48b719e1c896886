//! Push-stream transports that feed the stream client.
//!
//! A transport turns an endpoint URL into a stream of text frames. Ending
//! the stream or yielding an error both count as losing the connection.

use std::fmt;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::credentials::{bearer_token, CredentialStore};
use crate::stream::sse::SseDecoder;

/// Text frames produced by an open connection.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// Opens push-stream connections.
pub trait EventTransport: Send + Sync {
    /// Opens a new connection to `url`.
    ///
    /// Each call must create an independent connection; the stream client
    /// drops the previous stream before reconnecting.
    fn open(&self, url: &str) -> BoxFuture<'static, Result<FrameStream, TransportError>>;
}

/// Errors produced while opening or reading a push stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("unexpected http status {0}")]
    Status(StatusCode),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Server-sent-events transport over `reqwest`.
#[derive(Clone)]
pub struct SseTransport {
    http: Client,
    bearer: Option<SecretString>,
    credentials: Option<Arc<dyn CredentialStore>>,
}

impl SseTransport {
    pub fn new() -> Result<Self, TransportError> {
        let http = Client::builder().build()?;
        Ok(Self::with_client(http))
    }

    pub fn with_client(http: Client) -> Self {
        Self {
            http,
            bearer: None,
            credentials: None,
        }
    }

    /// Sends `Authorization: Bearer <token>` when opening the stream.
    pub fn with_bearer(mut self, token: SecretString) -> Self {
        self.bearer = Some(token);
        self
    }

    /// Reads the bearer from `credentials` on every open, so reconnects
    /// pick up a later login or a cleared token. A fixed bearer wins.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    fn current_bearer(&self) -> Option<SecretString> {
        self.bearer.clone().or_else(|| {
            self.credentials
                .as_deref()
                .and_then(|credentials| bearer_token(credentials))
        })
    }
}

impl fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseTransport")
            .field("fixed_bearer", &self.bearer.is_some())
            .field("credentials", &self.credentials.is_some())
            .finish()
    }
}

impl EventTransport for SseTransport {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let mut request = self.http.get(url).header(ACCEPT, "text/event-stream");
        if let Some(token) = self.current_bearer() {
            request = request.bearer_auth(token.expose_secret());
        }

        Box::pin(async move {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Status(status));
            }

            let mut decoder = SseDecoder::new();
            let frames = response
                .bytes_stream()
                .map(move |chunk| match chunk {
                    Ok(bytes) => decoder.feed(&bytes).into_iter().map(Ok).collect(),
                    Err(err) => vec![Err(TransportError::Http(err))],
                })
                .flat_map(stream::iter);
            Ok(frames.boxed())
        })
    }
}

/// Websocket transport over `tokio-tungstenite`; each text message is a
/// frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketTransport;

impl EventTransport for WebSocketTransport {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let url = websocket_url(url);
        Box::pin(async move {
            let request = url.as_str().into_client_request()?;
            let (socket, _) = connect_async(request).await?;
            let frames = socket.filter_map(|message| {
                future::ready(match message {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(_) => None,
                    Err(err) => Some(Err(TransportError::WebSocket(err))),
                })
            });
            Ok(frames.boxed())
        })
    }
}

/// Rewrites an `http(s)` endpoint to the matching `ws(s)` scheme.
pub fn websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// Whether `url` names a websocket endpoint.
pub fn is_websocket_url(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://")
}

#[cfg(test)]
mod tests {
    use super::{is_websocket_url, websocket_url};

    #[test]
    fn rewrites_http_schemes_to_websocket() {
        assert_eq!(websocket_url("http://localhost:8080/events"), "ws://localhost:8080/events");
        assert_eq!(websocket_url("https://db.example/events"), "wss://db.example/events");
        assert_eq!(websocket_url("ws://already/ws"), "ws://already/ws");
    }

    #[test]
    fn detects_websocket_endpoints() {
        assert!(is_websocket_url("wss://db.example/events"));
        assert!(!is_websocket_url("http://localhost:8080/events"));
    }
}
