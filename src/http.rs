//! Shared HTTP plumbing for the REST clients.
//!
//! All request/response clients funnel through [`HttpCore`], which attaches
//! the bearer credential, applies the per-request timeout and translates
//! failures into [`ApiError`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::credentials::{bearer_token, CredentialStore, ADMIN_KEY, AUTH_TOKEN_KEY};
use crate::stream::transport::TransportError;

const ERROR_BODY_SNIPPET_LEN: usize = 220;

/// Errors returned by the CRUD, auth and admin clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    /// The call was rejected locally before any network I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("stream setup failed: {0}")]
    Stream(#[from] TransportError),
}

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Transport(err) => err.status(),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED)
    }
}

/// Connection settings shared by every REST client.
#[derive(Clone, Debug)]
pub struct HttpOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl HttpOptions {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Self::CONNECT_TIMEOUT,
            request_timeout: Self::REQUEST_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub(crate) struct HttpCore {
    http: Client,
    base_url: Url,
    request_timeout: Duration,
    credentials: Arc<dyn CredentialStore>,
}

impl HttpCore {
    pub(crate) fn new(
        base_url: &str,
        credentials: Arc<dyn CredentialStore>,
        options: &HttpOptions,
    ) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url.trim_end())
            .map_err(|err| ApiError::InvalidArgument(format!("base url {base_url:?}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidArgument(format!(
                "base url {base_url} cannot carry a path"
            )));
        }
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url,
            request_timeout: options.request_timeout,
            credentials,
        })
    }

    pub(crate) fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    /// Base URL with `segments` appended as percent-encoded path segments.
    pub(crate) fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// `Authorization` header value; the admin key wins over the user token.
    pub(crate) fn bearer(&self) -> Option<SecretString> {
        bearer_token(&*self.credentials)
    }

    pub(crate) fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, self.endpoint(segments))
            .timeout(self.request_timeout);
        if let Some(token) = self.bearer() {
            builder = builder.bearer_auth(token.expose_secret());
        }
        builder
    }

    /// Sends `request`, returning the status and body of a 2xx response.
    pub(crate) async fn send(
        &self,
        request: RequestBuilder,
    ) -> Result<(StatusCode, String), ApiError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(event = "http_response", status = status.as_u16());

        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }
        Ok((status, body))
    }

    /// Like [`HttpCore::send`], but a 401 clears the stored credentials.
    pub(crate) async fn send_authorized(
        &self,
        request: RequestBuilder,
    ) -> Result<(StatusCode, String), ApiError> {
        let result = self.send(request).await;
        if let Err(err) = &result {
            if err.is_unauthorized() {
                warn!(event = "credentials_rejected", "clearing stored credentials");
                self.clear_credentials();
            }
        }
        result
    }

    /// Sends an authorized request and parses the body as JSON.
    ///
    /// An empty body parses as `null`.
    pub(crate) async fn send_json(&self, request: RequestBuilder) -> Result<Value, ApiError> {
        let (_, body) = self.send_authorized(request).await?;
        parse_json_body(&body)
    }

    pub(crate) fn clear_credentials(&self) {
        for key in [AUTH_TOKEN_KEY, ADMIN_KEY] {
            if let Err(err) = self.credentials.remove(key) {
                warn!(event = "credential_remove_failed", key, error = %err);
            }
        }
    }
}

pub(crate) fn parse_json_body(body: &str) -> Result<Value, ApiError> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body).map_err(|err| ApiError::Parse(err.to_string()))
}

/// Extracts a human-readable message from an error response body.
///
/// Understands `{"error":{"message":..}}`, `{"error":".."}`,
/// `{"message":".."}` and `{"reason":".."}`; anything else is truncated.
pub(crate) fn summarize_error_body(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        let message = ["/error/message", "/error", "/message", "/reason"]
            .iter()
            .find_map(|pointer| parsed.pointer(pointer).and_then(Value::as_str));
        if let Some(message) = message {
            return message.to_string();
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

/// Rejects empty identifiers before they reach the wire.
pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::InvalidArgument(format!("{field} must not be empty")));
    }
    Ok(())
}
