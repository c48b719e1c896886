//! User registration and session calls under `<app>/auth`.

use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::credentials::AUTH_TOKEN_KEY;
use crate::http::{parse_json_body, require_non_empty, ApiError, HttpCore};

const AUTH_SEGMENT: &str = "auth";

/// Result of a successful [`AuthClient::login`].
#[derive(Clone, Debug)]
pub struct LoginOutcome {
    pub user_id: String,
    /// Session token, when the server issued one. It is also saved to the
    /// credential store.
    pub token: Option<SecretString>,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    username: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    user_id: String,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Clone)]
pub struct AuthClient {
    core: HttpCore,
}

impl AuthClient {
    pub(crate) fn new(core: HttpCore) -> Self {
        Self { core }
    }

    /// Returns `true` when the server created the account (HTTP 201).
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &SecretString,
    ) -> Result<bool, ApiError> {
        require_non_empty("username", username)?;
        require_non_empty("email", email)?;
        let request = self
            .core
            .request(Method::POST, &[AUTH_SEGMENT, "register"])
            .json(&RegisterRequest {
                username,
                email,
                password: password.expose_secret(),
            });
        let (status, _) = self.core.send(request).await?;
        Ok(status == StatusCode::CREATED)
    }

    pub async fn login(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<LoginOutcome, ApiError> {
        require_non_empty("username", username)?;
        let request = self
            .core
            .request(Method::POST, &[AUTH_SEGMENT, "login"])
            .json(&LoginRequest {
                username,
                password: password.expose_secret(),
            });
        let (_, body) = self.core.send(request).await?;
        let parsed: LoginResponse = serde_json::from_value(parse_json_body(&body)?)
            .map_err(|err| ApiError::Parse(format!("login response: {err}")))?;

        let token = parsed.token.map(SecretString::new);
        if let Some(token) = token.as_ref() {
            if let Err(err) = self.core.credentials().store(AUTH_TOKEN_KEY, token.clone()) {
                warn!(event = "auth_token_persist_failed", error = %err);
            }
        }
        info!(event = "auth_login", user_id = %parsed.user_id);

        Ok(LoginOutcome {
            user_id: parsed.user_id,
            token,
        })
    }

    /// Ends the session. The stored token is cleared whatever the server
    /// answers; returns `true` on HTTP 200.
    pub async fn logout(&self) -> Result<bool, ApiError> {
        let request = self.core.request(Method::POST, &[AUTH_SEGMENT, "logout"]);
        let result = self.core.send(request).await;
        if let Err(err) = self.core.credentials().remove(AUTH_TOKEN_KEY) {
            warn!(event = "auth_token_remove_failed", error = %err);
        }
        let (status, _) = result?;
        Ok(status == StatusCode::OK)
    }
}
