//! Change events delivered over the realtime stream.
//!
//! The wire shape is a flat JSON object with a loosely structured
//! `eventData` bag. It is decoded into [`RawChangeEvent`] first and then
//! validated into a [`ChangeEvent`] whose payload is keyed by the action.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Mutation kind that produced a change event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records created by an insert.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InsertData {
    pub affected: Option<Vec<Value>>,
    pub ids: Option<Vec<String>>,
    pub count: Option<u64>,
}

/// Records changed by an update, with the filter and operation applied.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateData {
    pub affected: Option<Vec<Value>>,
    pub filter: Option<Value>,
    pub update_operation: Option<Value>,
    pub ids: Option<Vec<String>>,
    pub count: Option<u64>,
}

/// Records removed by a delete.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeleteData {
    pub affected: Option<Vec<Value>>,
    pub filter: Option<Value>,
    pub ids: Option<Vec<String>>,
    pub count: Option<u64>,
}

/// Action-specific payload of a [`ChangeEvent`].
#[derive(Clone, Debug, PartialEq)]
pub enum ChangePayload {
    Insert(InsertData),
    Update(UpdateData),
    Delete(DeleteData),
}

impl ChangePayload {
    pub fn action(&self) -> ChangeAction {
        match self {
            Self::Insert(_) => ChangeAction::Insert,
            Self::Update(_) => ChangeAction::Update,
            Self::Delete(_) => ChangeAction::Delete,
        }
    }

    /// Affected records, when the server included them.
    pub fn affected(&self) -> Option<&[Value]> {
        match self {
            Self::Insert(data) => data.affected.as_deref(),
            Self::Update(data) => data.affected.as_deref(),
            Self::Delete(data) => data.affected.as_deref(),
        }
    }

    /// Ids of affected records, when the server included them.
    pub fn ids(&self) -> Option<&[String]> {
        match self {
            Self::Insert(data) => data.ids.as_deref(),
            Self::Update(data) => data.ids.as_deref(),
            Self::Delete(data) => data.ids.as_deref(),
        }
    }

    pub fn count(&self) -> Option<u64> {
        match self {
            Self::Insert(data) => data.count,
            Self::Update(data) => data.count,
            Self::Delete(data) => data.count,
        }
    }
}

/// One change notification for a collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawChangeEvent", into = "RawChangeEvent")]
pub struct ChangeEvent {
    /// Collection the change happened in.
    pub topic: String,
    /// Correlation id echoed back from the originating mutation.
    pub operation_id: String,
    pub payload: ChangePayload,
}

impl ChangeEvent {
    pub fn action(&self) -> ChangeAction {
        self.payload.action()
    }

    /// Parses and validates one stream frame.
    pub fn from_text(text: &str) -> Result<Self, EventParseError> {
        let raw: RawChangeEvent = serde_json::from_str(text)?;
        Self::try_from(raw)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Errors raised while decoding a stream frame into a [`ChangeEvent`].
#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("{action} event data has none of: {expected}")]
    EmptyPayload {
        action: ChangeAction,
        expected: &'static str,
    },
}

/// Wire representation of a change event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChangeEvent {
    pub collection: String,
    pub action: ChangeAction,
    pub operation_id: String,
    #[serde(default)]
    pub event_data: RawEventData,
}

/// Wire representation of `eventData`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEventData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_operation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
}

impl TryFrom<RawChangeEvent> for ChangeEvent {
    type Error = EventParseError;

    fn try_from(raw: RawChangeEvent) -> Result<Self, Self::Error> {
        if raw.collection.is_empty() {
            return Err(EventParseError::MissingField("collection"));
        }
        if raw.operation_id.is_empty() {
            return Err(EventParseError::MissingField("operationId"));
        }

        let data = raw.event_data;
        let payload = match raw.action {
            ChangeAction::Insert => {
                if data.affected.is_none() && data.ids.is_none() {
                    return Err(EventParseError::EmptyPayload {
                        action: ChangeAction::Insert,
                        expected: "affected, ids",
                    });
                }
                ChangePayload::Insert(InsertData {
                    affected: data.affected,
                    ids: data.ids,
                    count: data.count,
                })
            }
            ChangeAction::Update => {
                if data.affected.is_none()
                    && data.update_operation.is_none()
                    && data.ids.is_none()
                    && data.count.is_none()
                {
                    return Err(EventParseError::EmptyPayload {
                        action: ChangeAction::Update,
                        expected: "affected, updateOperation, ids, count",
                    });
                }
                ChangePayload::Update(UpdateData {
                    affected: data.affected,
                    filter: data.filter,
                    update_operation: data.update_operation,
                    ids: data.ids,
                    count: data.count,
                })
            }
            ChangeAction::Delete => {
                if data.ids.is_none()
                    && data.count.is_none()
                    && data.filter.is_none()
                    && data.affected.is_none()
                {
                    return Err(EventParseError::EmptyPayload {
                        action: ChangeAction::Delete,
                        expected: "ids, count, filter, affected",
                    });
                }
                ChangePayload::Delete(DeleteData {
                    affected: data.affected,
                    filter: data.filter,
                    ids: data.ids,
                    count: data.count,
                })
            }
        };

        Ok(Self {
            topic: raw.collection,
            operation_id: raw.operation_id,
            payload,
        })
    }
}

impl From<ChangeEvent> for RawChangeEvent {
    fn from(event: ChangeEvent) -> Self {
        let action = event.action();
        let event_data = match event.payload {
            ChangePayload::Insert(data) => RawEventData {
                affected: data.affected,
                ids: data.ids,
                count: data.count,
                ..RawEventData::default()
            },
            ChangePayload::Update(data) => RawEventData {
                affected: data.affected,
                filter: data.filter,
                update_operation: data.update_operation,
                count: data.count,
                ids: data.ids,
            },
            ChangePayload::Delete(data) => RawEventData {
                affected: data.affected,
                filter: data.filter,
                ids: data.ids,
                count: data.count,
                ..RawEventData::default()
            },
        };

        Self {
            collection: event.topic,
            action,
            operation_id: event.operation_id,
            event_data,
        }
    }
}
