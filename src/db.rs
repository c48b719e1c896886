//! CRUD client for collection documents.
//!
//! Reads are plain REST calls. Every mutation is tagged with a fresh
//! operation id that is registered with the [`EchoSuppressor`] before the
//! request leaves, so the change event the server broadcasts back to this
//! client is dropped by the stream.

use reqwest::Method;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::echo::EchoSuppressor;
use crate::http::{require_non_empty, ApiError, HttpCore};
use crate::stream::event::ChangeAction;

const API_SEGMENT: &str = "api";
const SOME_SEGMENT: &str = "some";

/// Paging for [`DatabaseClient::get_some`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageRequest {
    pub limit: u32,
    pub offset: u32,
    pub sort_key: Option<String>,
}

impl PageRequest {
    pub const DEFAULT_LIMIT: u32 = 10;

    pub fn sorted_by(mut self, sort_key: impl Into<String>) -> Self {
        self.sort_key = Some(sort_key.into());
        self
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
            sort_key: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MutationBody<'a> {
    collection: &'a str,
    operation_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_items: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_item: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    update_operation: Option<&'a Value>,
}

impl<'a> MutationBody<'a> {
    fn new(collection: &'a str, operation_id: &'a str) -> Self {
        Self {
            collection,
            operation_id,
            new_items: None,
            new_item: None,
            filter: None,
            update_operation: None,
        }
    }
}

/// Client for `<app>/api`.
#[derive(Clone)]
pub struct DatabaseClient {
    core: HttpCore,
    echo: EchoSuppressor,
}

impl DatabaseClient {
    pub(crate) fn new(core: HttpCore, echo: EchoSuppressor) -> Self {
        Self { core, echo }
    }

    pub async fn get_one(&self, collection: &str, id: &str) -> Result<Value, ApiError> {
        require_non_empty("collection", collection)?;
        require_non_empty("id", id)?;
        let request = self
            .core
            .request(Method::GET, &[API_SEGMENT, id])
            .query(&[("collection", collection)]);
        self.core.send_json(request).await
    }

    pub async fn get_some(&self, collection: &str, page: &PageRequest) -> Result<Value, ApiError> {
        require_non_empty("collection", collection)?;
        let mut query = vec![
            ("collection", collection.to_string()),
            ("limit", page.limit.to_string()),
            ("offset", page.offset.to_string()),
        ];
        if let Some(sort_key) = page.sort_key.as_ref() {
            query.push(("sortKey", sort_key.clone()));
        }
        let request = self
            .core
            .request(Method::GET, &[API_SEGMENT, SOME_SEGMENT])
            .query(&query);
        self.core.send_json(request).await
    }

    pub async fn get_all(&self, collection: &str) -> Result<Value, ApiError> {
        require_non_empty("collection", collection)?;
        let request = self
            .core
            .request(Method::GET, &[API_SEGMENT])
            .query(&[("collection", collection)]);
        self.core.send_json(request).await
    }

    /// Inserts `items`; at least one item is required.
    pub async fn insert<T: Serialize>(
        &self,
        collection: &str,
        items: &[T],
    ) -> Result<Value, ApiError> {
        require_non_empty("collection", collection)?;
        if items.is_empty() {
            return Err(ApiError::InvalidArgument(
                "insert requires at least one item".to_string(),
            ));
        }
        let items = items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;

        let operation_id = self.begin(collection, ChangeAction::Insert);
        let body = MutationBody {
            new_items: Some(items),
            ..MutationBody::new(collection, &operation_id)
        };
        let request = self.core.request(Method::POST, &[API_SEGMENT]).json(&body);
        self.core.send_json(request).await
    }

    pub async fn update_one(
        &self,
        collection: &str,
        id: &str,
        update_operation: &Value,
    ) -> Result<Value, ApiError> {
        require_non_empty("collection", collection)?;
        require_non_empty("id", id)?;
        require_object("updateOperation", update_operation)?;

        let operation_id = self.begin(collection, ChangeAction::Update);
        let body = MutationBody {
            update_operation: Some(update_operation),
            ..MutationBody::new(collection, &operation_id)
        };
        let request = self.core.request(Method::PATCH, &[API_SEGMENT, id]).json(&body);
        self.core.send_json(request).await
    }

    /// Updates every document matching `filter`; the filter must not be
    /// empty (use [`DatabaseClient::update_all`] for that).
    pub async fn update_some(
        &self,
        collection: &str,
        filter: &Value,
        update_operation: &Value,
    ) -> Result<Value, ApiError> {
        require_non_empty("collection", collection)?;
        require_object("filter", filter)?;
        require_object("updateOperation", update_operation)?;

        let operation_id = self.begin(collection, ChangeAction::Update);
        let body = MutationBody {
            filter: Some(filter),
            update_operation: Some(update_operation),
            ..MutationBody::new(collection, &operation_id)
        };
        let request = self
            .core
            .request(Method::PATCH, &[API_SEGMENT, SOME_SEGMENT])
            .json(&body);
        self.core.send_json(request).await
    }

    pub async fn update_all(
        &self,
        collection: &str,
        update_operation: &Value,
    ) -> Result<Value, ApiError> {
        require_non_empty("collection", collection)?;
        require_object("updateOperation", update_operation)?;

        let operation_id = self.begin(collection, ChangeAction::Update);
        let body = MutationBody {
            update_operation: Some(update_operation),
            ..MutationBody::new(collection, &operation_id)
        };
        let request = self.core.request(Method::PATCH, &[API_SEGMENT]).json(&body);
        self.core.send_json(request).await
    }

    /// Replaces the document `id` wholesale.
    pub async fn replace<T: Serialize>(
        &self,
        collection: &str,
        id: &str,
        item: &T,
    ) -> Result<Value, ApiError> {
        require_non_empty("collection", collection)?;
        require_non_empty("id", id)?;
        let item = serde_json::to_value(item)?;

        let operation_id = self.begin(collection, ChangeAction::Update);
        let body = MutationBody {
            new_item: Some(item),
            ..MutationBody::new(collection, &operation_id)
        };
        let request = self.core.request(Method::PUT, &[API_SEGMENT, id]).json(&body);
        self.core.send_json(request).await
    }

    pub async fn remove_one(&self, collection: &str, id: &str) -> Result<Value, ApiError> {
        require_non_empty("collection", collection)?;
        require_non_empty("id", id)?;

        let operation_id = self.begin(collection, ChangeAction::Delete);
        let request = self
            .core
            .request(Method::DELETE, &[API_SEGMENT, id])
            .query(&[("collection", collection), ("operationId", &operation_id)]);
        self.core.send_json(request).await
    }

    /// Removes every document matching `filter`. Filter fields are sent as
    /// query parameters; an empty filter is rejected.
    pub async fn remove_some(&self, collection: &str, filter: &Value) -> Result<Value, ApiError> {
        require_non_empty("collection", collection)?;
        let fields = require_object("filter", filter)?;
        let mut query = filter_query(fields);

        let operation_id = self.begin(collection, ChangeAction::Delete);
        query.push(("collection".to_string(), collection.to_string()));
        query.push(("operationId".to_string(), operation_id));
        let request = self
            .core
            .request(Method::DELETE, &[API_SEGMENT, SOME_SEGMENT])
            .query(&query);
        self.core.send_json(request).await
    }

    pub async fn remove_all(&self, collection: &str) -> Result<Value, ApiError> {
        require_non_empty("collection", collection)?;

        let operation_id = self.begin(collection, ChangeAction::Delete);
        let request = self
            .core
            .request(Method::DELETE, &[API_SEGMENT])
            .query(&[("collection", collection), ("operationId", &operation_id)]);
        self.core.send_json(request).await
    }

    /// Issues and registers the operation id for one mutation.
    ///
    /// An id whose request fails stays pending until the sweep drops it.
    fn begin(&self, collection: &str, action: ChangeAction) -> String {
        let operation_id = self.echo.generate_operation_id();
        self.echo.register_pending(&operation_id, collection, action);
        debug!(
            event = "db_mutation",
            collection,
            action = %action,
            operation_id = %operation_id,
        );
        operation_id
    }
}

fn require_object<'v>(field: &str, value: &'v Value) -> Result<&'v Map<String, Value>, ApiError> {
    match value.as_object() {
        Some(fields) if !fields.is_empty() => Ok(fields),
        _ => Err(ApiError::InvalidArgument(format!(
            "{field} must be a non-empty object"
        ))),
    }
}

fn filter_query(fields: &Map<String, Value>) -> Vec<(String, String)> {
    fields
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use super::{filter_query, DatabaseClient, MutationBody, PageRequest};
    use crate::credentials::MemoryCredentialStore;
    use crate::echo::EchoSuppressor;
    use crate::http::{ApiError, HttpCore, HttpOptions};

    fn client(echo: EchoSuppressor) -> DatabaseClient {
        let core = HttpCore::new(
            "http://127.0.0.1:9/pendulum",
            Arc::new(MemoryCredentialStore::default()),
            &HttpOptions::default(),
        )
        .expect("build core");
        DatabaseClient::new(core, echo)
    }

    #[test]
    fn mutation_body_uses_wire_names() {
        let update = json!({"$set": {"done": true}});
        let body = MutationBody {
            update_operation: Some(&update),
            ..MutationBody::new("todos", "op-1")
        };
        let value = serde_json::to_value(&body).expect("encode");

        assert_eq!(
            value,
            json!({
                "collection": "todos",
                "operationId": "op-1",
                "updateOperation": {"$set": {"done": true}}
            })
        );
    }

    #[test]
    fn filter_values_become_query_strings() {
        let filter = json!({"status": "open", "priority": 2, "archived": false});
        let mut query = filter_query(filter.as_object().expect("object"));
        query.sort();

        assert_eq!(
            query,
            vec![
                ("archived".to_string(), "false".to_string()),
                ("priority".to_string(), "2".to_string()),
                ("status".to_string(), "open".to_string()),
            ]
        );
    }

    #[test]
    fn page_request_defaults() {
        let page = PageRequest::default().sorted_by("createdAt");
        assert_eq!(page.limit, 10);
        assert_eq!(page.offset, 0);
        assert_eq!(page.sort_key.as_deref(), Some("createdAt"));
    }

    #[tokio::test]
    async fn misuse_is_rejected_before_registering() {
        let echo = EchoSuppressor::new();
        let db = client(echo.clone());

        let empty: [Value; 0] = [];
        assert!(matches!(
            db.insert("todos", &empty).await,
            Err(ApiError::InvalidArgument(_))
        ));
        assert!(matches!(
            db.remove_some("todos", &json!({})).await,
            Err(ApiError::InvalidArgument(_))
        ));
        assert!(matches!(
            db.update_some("todos", &json!({}), &json!({"$set": {"a": 1}})).await,
            Err(ApiError::InvalidArgument(_))
        ));
        assert!(matches!(
            db.remove_one("todos", "").await,
            Err(ApiError::InvalidArgument(_))
        ));
        assert!(matches!(
            db.get_all("").await,
            Err(ApiError::InvalidArgument(_))
        ));
        assert_eq!(echo.pending_count(), 0);
    }

    #[tokio::test]
    async fn failed_mutation_leaves_operation_pending() {
        let echo = EchoSuppressor::new();
        let db = client(echo.clone());

        let result = db.remove_all("todos").await;
        assert!(matches!(result, Err(ApiError::Transport(_))));

        let pending = echo.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].topic, "todos");
    }
}
