//! Wire types for the A2A message fabric
//!
//! Agents exchange [`A2AMessage`]s wrapped in [`Envelope`]s. The envelope
//! duplicates the routing fields of the inner message so the broker can route
//! without parsing the payload. Message bodies are free-form JSON mappings on
//! the wire; [`MessageBody`] gives them a typed shape keyed off the envelope
//! type.

use crate::error::{FabricError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

/// Envelope protocol version
pub const PROTOCOL_VERSION: &str = "1.0";

/// Capability key naming what an agent does
pub const CAPABILITY_ROLE: &str = "role";
/// Capability key naming the service an agent implements
pub const CAPABILITY_TOOL: &str = "tool";

/// Mint a fresh opaque identifier (hex, no hyphens)
pub fn fresh_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// The record an agent advertises at registration
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentInfo {
    /// Logical role name (not unique)
    pub name: String,
    /// Absolute URL where inbound envelopes are POSTed
    pub callback_url: String,
    /// Free-form capability descriptors; `role` and `tool` are recognized by discovery
    #[serde(default)]
    #[schema(value_type = Object)]
    pub capabilities: HashMap<String, Value>,
    /// Stable identity; the broker mints one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Types of messages carried by the fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Query,
    Response,
    Heartbeat,
    Ack,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Query => "query",
            MessageType::Response => "response",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Ack => "ack",
        };
        write!(f, "{}", s)
    }
}

/// Application-level message carried inside an envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2AMessage {
    pub message_id: String,
    pub sender: String,
    pub recipient: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub body: Value,
}

impl A2AMessage {
    /// Build a message with a fresh id and the current time
    pub fn new(kind: MessageType, sender: &str, recipient: &str, body: MessageBody) -> Self {
        Self {
            message_id: fresh_id(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            timestamp: Utc::now(),
            kind,
            body: body.to_value(),
        }
    }

    /// Same as [`A2AMessage::new`] but with a caller-chosen message id
    /// (queries use `message_id == correlation_id`)
    pub fn with_id(
        message_id: &str,
        kind: MessageType,
        sender: &str,
        recipient: &str,
        body: MessageBody,
    ) -> Self {
        Self {
            message_id: message_id.to_string(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            timestamp: Utc::now(),
            kind,
            body: body.to_value(),
        }
    }

    /// Parse the body according to the message type
    pub fn typed_body(&self) -> Result<MessageBody> {
        MessageBody::parse(self.kind, &self.body)
    }
}

/// Transport wrapper routed by the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub sender: String,
    pub recipient: String,
    pub payload: Value,
}

impl Envelope {
    /// Wrap a message, deriving the envelope header from the inner message so
    /// the two can never disagree
    pub fn wrap(message: &A2AMessage) -> Result<Self> {
        Ok(Self {
            version: PROTOCOL_VERSION.to_string(),
            message_id: message.message_id.clone(),
            timestamp: Utc::now(),
            kind: message.kind,
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            payload: serde_json::to_value(message)?,
        })
    }

    /// Self-addressed heartbeat envelope with an empty payload
    pub fn heartbeat(agent_id: &str) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            message_id: fresh_id(),
            timestamp: Utc::now(),
            kind: MessageType::Heartbeat,
            sender: agent_id.to_string(),
            recipient: agent_id.to_string(),
            payload: json!({}),
        }
    }

    /// Deserialize the inner message
    pub fn message(&self) -> Result<A2AMessage> {
        serde_json::from_value(self.payload.clone()).map_err(FabricError::from)
    }
}

/// Typed view over a message body, keyed by the envelope type
///
/// Wire keys follow the original deployment: `sql`, `resultado`, `status`,
/// `correlation_id`.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Query {
        sql: String,
        correlation_id: String,
    },
    Response {
        rows: Vec<Value>,
        correlation_id: String,
    },
    Ack {
        status: String,
        correlation_id: String,
    },
    Empty,
}

impl MessageBody {
    pub fn to_value(&self) -> Value {
        match self {
            MessageBody::Query {
                sql,
                correlation_id,
            } => json!({ "sql": sql, "correlation_id": correlation_id }),
            MessageBody::Response {
                rows,
                correlation_id,
            } => json!({ "resultado": rows, "correlation_id": correlation_id }),
            MessageBody::Ack {
                status,
                correlation_id,
            } => json!({ "status": status, "correlation_id": correlation_id }),
            MessageBody::Empty => json!({}),
        }
    }

    pub fn parse(kind: MessageType, body: &Value) -> Result<Self> {
        let corr = || {
            body.get("correlation_id")
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| FabricError::Validation("body missing correlation_id".to_string()))
        };

        match kind {
            MessageType::Query => Ok(MessageBody::Query {
                sql: body
                    .get("sql")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .ok_or_else(|| FabricError::Validation("query body missing sql".to_string()))?,
                correlation_id: corr()?,
            }),
            MessageType::Response => Ok(MessageBody::Response {
                rows: body
                    .get("resultado")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                correlation_id: corr()?,
            }),
            MessageType::Ack => Ok(MessageBody::Ack {
                status: body
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("received")
                    .to_string(),
                correlation_id: corr()?,
            }),
            MessageType::Heartbeat => Ok(MessageBody::Empty),
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            MessageBody::Query { correlation_id, .. }
            | MessageBody::Response { correlation_id, .. }
            | MessageBody::Ack { correlation_id, .. } => Some(correlation_id),
            MessageBody::Empty => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_id_format() {
        let id = fresh_id();
        assert_eq!(id.len(), 32);
        assert!(!id.contains('-'));
    }

    #[test]
    fn test_envelope_wrap_agrees_with_message() {
        let body = MessageBody::Query {
            sql: "SELECT 1;".to_string(),
            correlation_id: "c1".to_string(),
        };
        let msg = A2AMessage::with_id("c1", MessageType::Query, "a", "b", body);
        let env = Envelope::wrap(&msg).unwrap();

        assert_eq!(env.version, PROTOCOL_VERSION);
        assert_eq!(env.message_id, msg.message_id);
        assert_eq!(env.kind, msg.kind);
        assert_eq!(env.sender, msg.sender);
        assert_eq!(env.recipient, msg.recipient);

        let inner = env.message().unwrap();
        assert_eq!(inner.message_id, "c1");
        assert_eq!(inner.typed_body().unwrap().correlation_id(), Some("c1"));
    }

    #[test]
    fn test_heartbeat_envelope_is_self_addressed() {
        let env = Envelope::heartbeat("agent-1");
        assert_eq!(env.sender, env.recipient);
        assert_eq!(env.kind, MessageType::Heartbeat);
        assert_eq!(env.payload, json!({}));
    }

    #[test]
    fn test_message_type_wire_names() {
        assert_eq!(serde_json::to_string(&MessageType::Query).unwrap(), "\"query\"");
        assert_eq!(serde_json::to_string(&MessageType::Ack).unwrap(), "\"ack\"");
        let parsed: MessageType = serde_json::from_str("\"heartbeat\"").unwrap();
        assert_eq!(parsed, MessageType::Heartbeat);
    }

    #[test]
    fn test_body_roundtrip_by_type() {
        let response = MessageBody::Response {
            rows: vec![json!({"s": 42})],
            correlation_id: "c9".to_string(),
        };
        let wire = response.to_value();
        assert!(wire.get("resultado").is_some());
        assert_eq!(
            MessageBody::parse(MessageType::Response, &wire).unwrap(),
            response
        );
    }

    #[test]
    fn test_query_body_requires_sql() {
        let bad = json!({ "correlation_id": "c1" });
        assert!(MessageBody::parse(MessageType::Query, &bad).is_err());
    }
}
