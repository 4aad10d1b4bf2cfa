//! # Wire Envelopes
//!
//! Message and response envelopes exchanged with the host, plus the typed
//! host operations that are packed into them.
//!
//! ## Message Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Host Message Flow                                 │
//! │                                                                         │
//! │  CLIENT ───► MessageEnvelope  { id, target, operation, payload,        │
//! │                                 createdAt }                             │
//! │                                                                         │
//! │  HOST   ───► InboundMessage::Response(ResponseEnvelope)                │
//! │              { kind: "response", id, result?, error?, success,         │
//! │                respondedAt? }                                          │
//! │                                                                         │
//! │  HOST   ───► InboundMessage::Change(DataChange)   (uncorrelated push)  │
//! │              { kind: "change", id, entity, operation, data, ... }      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Typed Operations
//! The host defines operation names per target. [`HostOperation`] is the
//! tagged union of the operations this client knows about; converting it
//! into envelope parts and back goes through serde, so a payload that does
//! not match its schema surfaces as [`BridgeError::Serialization`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;

use crate::change::DataChange;
use crate::error::{BridgeError, BridgeResult};

/// Key/value payload carried by envelopes and changes.
pub type Payload = Map<String, Value>;

// =============================================================================
// Target
// =============================================================================

/// Host capability a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Target {
    Database,
    Filesystem,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Database => write!(f, "database"),
            Target::Filesystem => write!(f, "filesystem"),
        }
    }
}

// =============================================================================
// Message Envelope
// =============================================================================

/// Outbound request to the host.
///
/// The `id` is unique per in-flight message; an envelope is never mutated
/// after it has been posted. Retries build a fresh envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct MessageEnvelope {
    /// Correlation id.
    pub id: String,

    /// Capability the message is addressed to.
    pub target: Target,

    /// Host-defined operation name (e.g. `updateNode`).
    pub operation: String,

    /// Operation arguments.
    #[ts(type = "Record<string, unknown>")]
    pub payload: Payload,

    /// Creation time (epoch milliseconds).
    #[ts(type = "number")]
    pub created_at: i64,
}

impl MessageEnvelope {
    /// Creates an envelope with a fresh correlation id, stamped now.
    pub fn new(target: Target, operation: impl Into<String>, payload: Payload) -> Self {
        Self::new_at(target, operation, payload, chrono::Utc::now().timestamp_millis())
    }

    /// Creates an envelope with an explicit creation time.
    pub fn new_at(
        target: Target,
        operation: impl Into<String>,
        payload: Payload,
        created_at: i64,
    ) -> Self {
        MessageEnvelope {
            id: uuid::Uuid::new_v4().to_string(),
            target,
            operation: operation.into(),
            payload,
            created_at,
        }
    }

    /// Serializes to JSON string.
    pub fn to_json(&self) -> BridgeResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// =============================================================================
// Response Envelope
// =============================================================================

/// Host answer to a [`MessageEnvelope`], matched by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ResponseEnvelope {
    /// Id of the request being answered.
    pub id: String,

    /// Result value on success.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    #[ts(type = "unknown")]
    pub result: Option<Value>,

    /// Host error message on failure.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Whether the host processed the request successfully.
    pub success: bool,

    /// Response time (epoch milliseconds).
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    #[ts(type = "number | null")]
    pub responded_at: Option<i64>,
}

impl ResponseEnvelope {
    /// Creates a successful response.
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        ResponseEnvelope {
            id: id.into(),
            result: Some(result),
            error: None,
            success: true,
            responded_at: Some(chrono::Utc::now().timestamp_millis()),
        }
    }

    /// Creates a failed response carrying a host error message.
    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        ResponseEnvelope {
            id: id.into(),
            result: None,
            error: Some(error.into()),
            success: false,
            responded_at: Some(chrono::Utc::now().timestamp_millis()),
        }
    }

    /// Converts into the caller-facing result.
    ///
    /// A successful response without a result resolves to `Value::Null`.
    pub fn into_result(self) -> BridgeResult<Value> {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(BridgeError::Application(
                self.error.unwrap_or_else(|| "unknown host error".to_string()),
            ))
        }
    }
}

// =============================================================================
// Inbound Message
// =============================================================================

/// Anything the host pushes to the client.
///
/// Internally tagged on `kind`:
/// `{ "kind": "response", "id": "...", "success": true }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InboundMessage {
    /// Answer to a correlated request.
    Response(ResponseEnvelope),

    /// Uncorrelated change notification.
    Change(DataChange),
}

impl InboundMessage {
    /// Deserializes from JSON string.
    pub fn from_json(json: &str) -> BridgeResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Returns the message kind as a string (for logging).
    pub fn kind_name(&self) -> &'static str {
        match self {
            InboundMessage::Response(_) => "response",
            InboundMessage::Change(_) => "change",
        }
    }
}

// =============================================================================
// Host Operations (Tagged Union)
// =============================================================================

/// Operations understood by the host, one variant per operation name.
///
/// Serialized adjacently tagged so the tag and content map directly onto
/// the envelope's `operation` and `payload` fields:
/// `{ "operation": "updateNode", "payload": { "table": "nodes", ... } }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "payload", rename_all = "camelCase")]
pub enum HostOperation {
    // =========================================================================
    // Database
    // =========================================================================
    CreateNode {
        table: String,
        id: String,
        data: Payload,
        #[serde(default)]
        version: u64,
        #[serde(default)]
        timestamp: i64,
    },

    UpdateNode {
        table: String,
        id: String,
        data: Payload,
        #[serde(default)]
        version: u64,
        #[serde(default)]
        timestamp: i64,
    },

    DeleteNode {
        table: String,
        id: String,
        #[serde(default)]
        version: u64,
        #[serde(default)]
        timestamp: i64,
    },

    Execute {
        sql: String,
        #[serde(default)]
        params: Vec<Value>,
    },

    // =========================================================================
    // Filesystem
    // =========================================================================
    ReadFile {
        path: String,
    },

    WriteFile {
        path: String,
        content: String,
    },

    ListFiles {
        path: String,
    },
}

impl HostOperation {
    /// Returns the capability this operation is addressed to.
    pub fn target(&self) -> Target {
        match self {
            HostOperation::CreateNode { .. }
            | HostOperation::UpdateNode { .. }
            | HostOperation::DeleteNode { .. }
            | HostOperation::Execute { .. } => Target::Database,
            HostOperation::ReadFile { .. }
            | HostOperation::WriteFile { .. }
            | HostOperation::ListFiles { .. } => Target::Filesystem,
        }
    }

    /// Returns the wire operation name.
    pub fn name(&self) -> &'static str {
        match self {
            HostOperation::CreateNode { .. } => "createNode",
            HostOperation::UpdateNode { .. } => "updateNode",
            HostOperation::DeleteNode { .. } => "deleteNode",
            HostOperation::Execute { .. } => "execute",
            HostOperation::ReadFile { .. } => "readFile",
            HostOperation::WriteFile { .. } => "writeFile",
            HostOperation::ListFiles { .. } => "listFiles",
        }
    }

    /// Splits into `(target, operation, payload)` envelope parts.
    pub fn into_parts(self) -> BridgeResult<(Target, String, Payload)> {
        let target = self.target();
        let mut tagged = match serde_json::to_value(&self)? {
            Value::Object(map) => map,
            other => {
                return Err(BridgeError::Serialization(format!(
                    "operation encoded as non-object: {other}"
                )))
            }
        };

        let operation = match tagged.remove("operation") {
            Some(Value::String(name)) => name,
            _ => return Err(BridgeError::Serialization("missing operation tag".into())),
        };

        let payload = match tagged.remove("payload") {
            Some(Value::Object(map)) => map,
            None => Payload::new(),
            Some(other) => {
                return Err(BridgeError::Serialization(format!(
                    "payload for {operation} is not an object: {other}"
                )))
            }
        };

        Ok((target, operation, payload))
    }

    /// Rebuilds a typed operation from an envelope's operation and payload.
    pub fn from_parts(operation: &str, payload: &Payload) -> BridgeResult<Self> {
        let mut tagged = Map::new();
        tagged.insert("operation".into(), Value::String(operation.to_string()));
        tagged.insert("payload".into(), Value::Object(payload.clone()));
        Ok(serde_json::from_value(Value::Object(tagged))?)
    }
}
