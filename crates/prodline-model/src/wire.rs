//! Push-event envelope, response envelope and request bodies.

use serde::{Deserialize, Serialize};

use crate::entity::EntityKind;

/// One push-event as it travels over the stream: `{ type, timestamp, data }`.
///
/// `data` stays untyped here; it is decoded once per kind by the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: serde_json::Value,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl StreamMessage {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            timestamp: serde_json::Value::from(crate::now_millis()),
            data,
        }
    }
}

/// What happened to a queue in a `QUEUE_EVENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueEventKind {
    ProductAdded,
    ProductRemoved,
    QueueEmpty,
}

/// Count-delta notification for a single queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEventPayload {
    pub event_type: QueueEventKind,
    pub queue_id: String,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub product_color: Option<String>,
    pub new_queue_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_products_generated: Option<u64>,
}

/// Machine highlight request.
///
/// Backends send either `{ "machineId": "M1" }` or the bare id string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlashPayload {
    Object {
        #[serde(rename = "machineId")]
        machine_id: String,
    },
    Bare(String),
}

impl FlashPayload {
    pub fn machine_id(&self) -> &str {
        match self {
            FlashPayload::Object { machine_id } => machine_id,
            FlashPayload::Bare(id) => id,
        }
    }
}

/// Response envelope for every request/response operation.
///
/// `success: false` is a recoverable condition, never a panic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Convert to a `Result`, using a generic message when none was supplied.
    pub fn into_result(self) -> std::result::Result<Option<T>, String> {
        if self.success {
            Ok(self.data)
        } else {
            Err(self.error.unwrap_or_else(|| "request failed".to_string()))
        }
    }
}

/// Body for placement and move requests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionRequest {
    pub x: f64,
    pub y: f64,
}

/// Body for connection creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    pub source_id: String,
    pub source_type: EntityKind,
    pub target_id: String,
    pub target_type: EntityKind,
}

/// Body for snapshot creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    #[serde(default)]
    pub label: Option<String>,
}
