//! Top-level client tying the REST surfaces, credentials and the realtime
//! stream together.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::auth::AuthClient;
use crate::credentials::{
    bearer_token, CredentialError, CredentialStore, MemoryCredentialStore, ADMIN_KEY,
    AUTH_TOKEN_KEY,
};
use crate::db::DatabaseClient;
use crate::echo::{EchoConfig, EchoSuppressor};
use crate::http::{require_non_empty, ApiError, HttpCore, HttpOptions};
use crate::retry::ReconnectPolicy;
use crate::stream::client::{StreamClient, StreamConfig, DEFAULT_EVENTS_URL};
use crate::stream::transport::{is_websocket_url, EventTransport, SseTransport, WebSocketTransport};

/// Default local application endpoint.
pub const DEFAULT_APP_URL: &str = "http://localhost:3000/pendulum";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PendulumDefaults;

impl PendulumDefaults {
    pub const CONNECT_TIMEOUT: Duration = HttpOptions::CONNECT_TIMEOUT;
    pub const REQUEST_TIMEOUT: Duration = HttpOptions::REQUEST_TIMEOUT;
    pub const ENABLE_REALTIME: bool = false;
}

#[derive(Clone, Debug)]
pub struct PendulumClientOptions {
    pub base_url: String,
    pub events_url: String,
    pub enable_realtime: bool,
    pub echo: EchoConfig,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for PendulumClientOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_APP_URL.to_string(),
            events_url: DEFAULT_EVENTS_URL.to_string(),
            enable_realtime: PendulumDefaults::ENABLE_REALTIME,
            echo: EchoConfig::default(),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: PendulumDefaults::CONNECT_TIMEOUT,
            request_timeout: PendulumDefaults::REQUEST_TIMEOUT,
        }
    }
}

impl PendulumClientOptions {
    pub fn with_realtime(mut self, enabled: bool) -> Self {
        self.enable_realtime = enabled;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_events_url(mut self, events_url: impl Into<String>) -> Self {
        self.events_url = events_url.into();
        self
    }

    pub fn with_reconnect_policy(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    fn http_options(&self) -> HttpOptions {
        HttpOptions {
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
        }
    }
}

/// Access lists for one collection.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CollectionPermissions {
    pub create: Vec<String>,
    pub read: Vec<String>,
    pub update: Vec<String>,
    pub delete: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PermissionsUpdate<'a> {
    new_permissions: &'a CollectionPermissions,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewCollection<'a> {
    new_collection: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminKeyRequest<'a> {
    admin_key: &'a str,
}

#[derive(Deserialize)]
struct AdminKeyResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    role: Option<String>,
}

pub struct PendulumClient {
    core: HttpCore,
    echo: EchoSuppressor,
    pub db: DatabaseClient,
    pub auth: AuthClient,
    pub realtime: Option<StreamClient>,
}

impl PendulumClient {
    /// Builds a client with process-local credential storage.
    ///
    /// # Panics
    ///
    /// With realtime enabled, panics when called outside a Tokio runtime.
    pub fn new(options: PendulumClientOptions) -> Result<Self, ApiError> {
        Self::with_credential_store(options, Arc::new(MemoryCredentialStore::default()))
    }

    /// Builds a client over `credentials`; stored tokens are picked up
    /// immediately.
    ///
    /// # Panics
    ///
    /// With realtime enabled, panics when called outside a Tokio runtime.
    pub fn with_credential_store(
        options: PendulumClientOptions,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, ApiError> {
        let core = HttpCore::new(&options.base_url, credentials, &options.http_options())?;
        let echo = EchoSuppressor::with_config(options.echo.clone());

        let realtime = if options.enable_realtime {
            let config = StreamConfig::new(options.events_url.as_str())
                .with_reconnect_policy(options.reconnect.clone());
            let transport = stream_transport(&config.url, core.credentials())?;
            Some(StreamClient::connect_with_transport(config, echo.clone(), transport))
        } else {
            None
        };

        info!(
            event = "pendulum_client_ready",
            base_url = %options.base_url,
            realtime = options.enable_realtime,
        );

        Ok(Self {
            db: DatabaseClient::new(core.clone(), echo.clone()),
            auth: AuthClient::new(core.clone()),
            core,
            echo,
            realtime,
        })
    }

    pub fn echo(&self) -> &EchoSuppressor {
        &self.echo
    }

    pub fn set_auth_token(&self, token: SecretString) -> Result<(), CredentialError> {
        self.core.credentials().store(AUTH_TOKEN_KEY, token)
    }

    pub fn auth_token(&self) -> Option<SecretString> {
        self.core.credentials().load(AUTH_TOKEN_KEY)
    }

    pub fn clear_auth_token(&self) -> Result<(), CredentialError> {
        self.core.credentials().remove(AUTH_TOKEN_KEY)
    }

    pub fn set_admin_key(&self, key: SecretString) -> Result<(), CredentialError> {
        self.core.credentials().store(ADMIN_KEY, key)
    }

    pub fn admin_key(&self) -> Option<SecretString> {
        self.core.credentials().load(ADMIN_KEY)
    }

    pub fn clear_admin_key(&self) -> Result<(), CredentialError> {
        self.core.credentials().remove(ADMIN_KEY)
    }

    pub fn is_authenticated(&self) -> bool {
        self.core.bearer().is_some()
    }

    pub fn is_admin(&self) -> bool {
        self.admin_key().is_some()
    }

    /// `Authorization` header value, preferring the admin key.
    pub fn auth_header(&self) -> Option<SecretString> {
        self.core
            .bearer()
            .map(|token| SecretString::new(format!("Bearer {}", token.expose_secret())))
    }

    /// Asks the server whether `key` is a valid admin key. The key is not
    /// stored; call [`PendulumClient::set_admin_key`] on success.
    pub async fn validate_admin_key(&self, key: &SecretString) -> Result<bool, ApiError> {
        let request = self
            .core
            .request(Method::POST, &["auth", "admin", "validate"])
            .json(&AdminKeyRequest {
                admin_key: key.expose_secret(),
            });
        let (_, body) = self.core.send(request).await?;
        let parsed: AdminKeyResponse = serde_json::from_str(&body)
            .map_err(|err| ApiError::Parse(format!("admin validation response: {err}")))?;
        Ok(parsed.success && parsed.role.as_deref() == Some("admin"))
    }

    pub async fn get_collection_permissions(&self, collection: &str) -> Result<Value, ApiError> {
        require_non_empty("collection", collection)?;
        let request = self
            .core
            .request(Method::GET, &["permissions", collection, "permissions"]);
        self.core.send_json(request).await
    }

    pub async fn update_collection_permissions(
        &self,
        collection: &str,
        permissions: &CollectionPermissions,
    ) -> Result<Value, ApiError> {
        require_non_empty("collection", collection)?;
        let request = self
            .core
            .request(Method::PUT, &["permissions", collection, "permissions"])
            .json(&PermissionsUpdate {
                new_permissions: permissions,
            });
        self.core.send_json(request).await
    }

    pub async fn create_collection(&self, collection: &str) -> Result<Value, ApiError> {
        require_non_empty("collection", collection)?;
        let request = self
            .core
            .request(Method::POST, &["collections"])
            .json(&NewCollection {
                new_collection: collection,
            });
        self.core.send_json(request).await
    }

    pub async fn get_all_collections(&self) -> Result<Value, ApiError> {
        let request = self.core.request(Method::GET, &["collections"]);
        self.core.send_json(request).await
    }

    pub async fn delete_collection(&self, collection: &str) -> Result<Value, ApiError> {
        require_non_empty("collection", collection)?;
        let request = self
            .core
            .request(Method::DELETE, &["collections"])
            .query(&[("collection", collection)]);
        self.core.send_json(request).await
    }

    /// Closes the realtime stream and drops every pending operation.
    pub fn shutdown(&self) {
        if let Some(realtime) = self.realtime.as_ref() {
            realtime.disconnect();
        }
        self.echo.reset();
        info!(event = "pendulum_client_shutdown");
    }
}

fn stream_transport(
    events_url: &str,
    credentials: &Arc<dyn CredentialStore>,
) -> Result<Arc<dyn EventTransport>, ApiError> {
    if is_websocket_url(events_url) {
        if bearer_token(&**credentials).is_some() {
            warn!(
                event = "stream_bearer_unsupported",
                "websocket stream is opened without credentials"
            );
        }
        return Ok(Arc::new(WebSocketTransport));
    }
    let transport = SseTransport::new()?.with_credentials(Arc::clone(credentials));
    Ok(Arc::new(transport))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use secrecy::{ExposeSecret, SecretString};
    use serde_json::json;

    use super::{CollectionPermissions, PendulumClient, PendulumClientOptions, PermissionsUpdate};
    use crate::credentials::{CredentialStore, MemoryCredentialStore, AUTH_TOKEN_KEY};

    fn secret(value: &str) -> SecretString {
        SecretString::new(value.to_string())
    }

    #[test]
    fn admin_key_wins_in_auth_header() {
        let client = PendulumClient::new(PendulumClientOptions::default()).expect("client");
        assert!(!client.is_authenticated());
        assert!(client.auth_header().is_none());

        client.set_auth_token(secret("user")).expect("token");
        assert!(client.is_authenticated());
        assert!(!client.is_admin());
        assert_eq!(client.auth_header().expect("header").expose_secret(), "Bearer user");

        client.set_admin_key(secret("root")).expect("admin");
        assert!(client.is_admin());
        assert_eq!(client.auth_header().expect("header").expose_secret(), "Bearer root");

        client.clear_admin_key().expect("clear admin");
        client.clear_auth_token().expect("clear token");
        assert!(!client.is_authenticated());
    }

    #[test]
    fn stored_token_is_picked_up() {
        let store = Arc::new(MemoryCredentialStore::default());
        store.store(AUTH_TOKEN_KEY, secret("saved")).expect("store");

        let client =
            PendulumClient::with_credential_store(PendulumClientOptions::default(), store)
                .expect("client");
        assert_eq!(client.auth_token().expect("token").expose_secret(), "saved");
    }

    #[test]
    fn realtime_is_off_by_default() {
        let client = PendulumClient::new(PendulumClientOptions::default()).expect("client");
        assert!(client.realtime.is_none());
        client.shutdown();
    }

    #[tokio::test]
    async fn shutdown_closes_stream_and_clears_pending() {
        let options = PendulumClientOptions::default()
            .with_events_url("http://127.0.0.1:9/events")
            .with_realtime(true);
        let client = PendulumClient::new(options).expect("client");
        client
            .echo()
            .register_pending("op-1", "users", crate::stream::event::ChangeAction::Insert);

        client.shutdown();

        let realtime = client.realtime.as_ref().expect("realtime");
        assert!(realtime.state().is_closed());
        assert_eq!(client.echo().pending_count(), 0);
        assert!(!client.echo().is_sweeping());
    }

    #[test]
    fn permissions_update_wire_shape() {
        let permissions = CollectionPermissions {
            create: vec!["admin".to_string()],
            read: vec!["public".to_string()],
            update: vec![],
            delete: vec![],
        };
        let value = serde_json::to_value(PermissionsUpdate {
            new_permissions: &permissions,
        })
        .expect("encode");
        assert_eq!(
            value,
            json!({
                "newPermissions": {
                    "create": ["admin"],
                    "read": ["public"],
                    "update": [],
                    "delete": []
                }
            })
        );
    }
}
