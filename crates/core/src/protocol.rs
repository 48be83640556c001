//! Wire protocol spoken between the master and its slaves.
//!
//! Every frame is a JSON [`Message`] envelope. The `type` tag and the payload
//! field names are the compatibility surface between master and slave builds,
//! so they are spelled out explicitly rather than derived from Rust names.

use crate::error::{FleetError, FleetResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Handshake header carrying the slave's host id.
pub const HOST_HEADER: &str = "x-slave-host";
/// Handshake header carrying the serial of the slave's credential.
pub const SERIAL_HEADER: &str = "x-slave-cert-serial";

/// An opaque tool description as advertised by a tool server
/// (MCP `name` / `description` / `inputSchema` object).
pub type ToolDescriptor = serde_json::Value;

/// Extract the `name` field of a tool descriptor.
pub fn tool_name(tool: &ToolDescriptor) -> Option<&str> {
    tool.get("name").and_then(serde_json::Value::as_str)
}

/// Closed set of frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// slave -> master: handshake after connect
    Register,
    /// slave -> master: liveness keep-alive
    Heartbeat,
    /// slave -> master: slave tool set changed
    ToolUpdate,
    /// master -> slave: invoke a slave-local tool
    ToolCall,
    /// either way: correlated reply
    Response,
    /// master -> slave: filtered master tool inventory
    MasterTools,
    /// slave -> master: invoke a master-local tool
    MasterToolCall,
    Restart,
    Upgrade,
    /// either way: protocol failure signal
    Error,
    /// Anything this build does not know about.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Requests that must carry a correlation id.
    pub fn expects_reply(self) -> bool {
        matches!(self, Self::ToolCall | Self::MasterToolCall | Self::Register)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Heartbeat => "heartbeat",
            Self::ToolUpdate => "tool_update",
            Self::ToolCall => "tool_call",
            Self::Response => "response",
            Self::MasterTools => "master_tools",
            Self::MasterToolCall => "master_tool_call",
            Self::Restart => "restart",
            Self::Upgrade => "upgrade",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope for all link traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Correlation id; echoed by replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl Message {
    /// Build a frame with a serialized payload.
    pub fn new(message_type: MessageType, data: impl Serialize) -> FleetResult<Self> {
        Ok(Self {
            message_type,
            id: None,
            timestamp: Utc::now(),
            data: serde_json::to_value(data)?,
        })
    }

    /// A frame with no payload (heartbeat, restart, upgrade).
    pub fn bare(message_type: MessageType) -> Self {
        Self {
            message_type,
            id: None,
            timestamp: Utc::now(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// An `error` frame, optionally correlated with the request that caused it.
    pub fn error(id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Error,
            id,
            timestamp: Utc::now(),
            data: serde_json::json!({ "error": message.into() }),
        }
    }

    /// A `response` frame echoing `id`.
    pub fn response(id: Option<String>, data: impl Serialize) -> FleetResult<Self> {
        let mut message = Self::new(MessageType::Response, data)?;
        message.id = id;
        Ok(message)
    }

    /// Decode the payload into a typed schema.
    pub fn decode_data<T: DeserializeOwned>(&self) -> FleetResult<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            FleetError::Protocol(format!("invalid {} payload: {}", self.message_type, e))
        })
    }

    pub fn to_json(&self) -> FleetResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> FleetResult<Self> {
        serde_json::from_str(text).map_err(|e| FleetError::Protocol(format!("malformed frame: {}", e)))
    }
}

/// `register` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub hostname: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// `tool_call` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub tool: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// `response` payload for tool calls in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallResponse {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Collapse into a result, treating `success: false` or a set error as failure.
    pub fn into_result(self) -> FleetResult<serde_json::Value> {
        match self.error {
            Some(error) if !error.is_empty() => Err(FleetError::ToolFailed(error)),
            _ if !self.success => Err(FleetError::ToolFailed("remote reported failure".to_string())),
            _ => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}

/// `master_tools` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterToolsPayload {
    /// Server name -> tools served by it on the master.
    pub servers: BTreeMap<String, Vec<ToolDescriptor>>,
    /// Context name -> enabled server names.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context_mappings: BTreeMap<String, Vec<String>>,
}

impl MasterToolsPayload {
    pub fn tool_count(&self) -> usize {
        self.servers.values().map(Vec::len).sum()
    }

    /// Servers visible under `context`; all servers when the context is unknown.
    pub fn servers_for_context(&self, context: &str) -> Vec<&str> {
        match self.context_mappings.get(context) {
            Some(enabled) => self
                .servers
                .keys()
                .filter(|name| enabled.iter().any(|e| e == *name))
                .map(String::as_str)
                .collect(),
            None => self.servers.keys().map(String::as_str).collect(),
        }
    }
}

/// `master_tool_call` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterToolCallPayload {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// `error` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_type_tags() {
        let msg = Message::new(
            MessageType::MasterToolCall,
            MasterToolCallPayload {
                server: "jobs".to_string(),
                tool: "list".to_string(),
                arguments: json!({}),
            },
        )
        .unwrap()
        .with_id("c-1");

        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "master_tool_call");
        assert_eq!(value["id"], "c-1");
        assert_eq!(value["data"]["server"], "jobs");
    }

    #[test]
    fn test_bare_frame_omits_id_and_data() {
        let json = Message::bare(MessageType::Heartbeat).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert!(value.get("id").is_none());
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_unknown_type_decodes() {
        let msg = Message::from_json(r#"{"type":"telemetry","id":"x"}"#).unwrap();
        assert_eq!(msg.message_type, MessageType::Unknown);
        assert_eq!(msg.id.as_deref(), Some("x"));
    }

    #[test]
    fn test_malformed_frame_is_protocol_error() {
        let err = Message::from_json("{not json").unwrap_err();
        assert!(matches!(err, FleetError::Protocol(_)));
    }

    #[test]
    fn test_register_payload_from_slave() {
        let msg = Message::from_json(
            r#"{"type":"register","id":"r1","timestamp":"2025-01-01T00:00:00Z",
                "data":{"hostname":"alpha","version":"1.2.0","tools":[{"name":"t1"},{"name":"t2"}]}}"#,
        )
        .unwrap();
        let payload: RegisterPayload = msg.decode_data().unwrap();
        assert_eq!(payload.hostname, "alpha");
        assert_eq!(payload.tools.len(), 2);
        assert_eq!(tool_name(&payload.tools[1]), Some("t2"));
    }

    #[test]
    fn test_decode_wrong_payload_is_protocol_error() {
        let msg = Message::new(MessageType::ToolCall, json!({"arguments": {}})).unwrap();
        let err = msg.decode_data::<ToolCallPayload>().unwrap_err();
        assert!(matches!(err, FleetError::Protocol(_)));
    }

    #[test]
    fn test_tool_call_response_into_result() {
        assert_eq!(
            ToolCallResponse::ok(json!({"n": 1})).into_result().unwrap(),
            json!({"n": 1})
        );
        assert!(matches!(
            ToolCallResponse::failed("boom").into_result(),
            Err(FleetError::ToolFailed(msg)) if msg == "boom"
        ));

        let silent_failure = ToolCallResponse {
            success: false,
            result: None,
            error: None,
        };
        assert!(silent_failure.into_result().is_err());
    }

    #[test]
    fn test_servers_for_context() {
        let mut payload = MasterToolsPayload::default();
        payload.servers.insert("jobs".to_string(), vec![json!({"name": "a"})]);
        payload.servers.insert("weather".to_string(), vec![json!({"name": "b"}), json!({"name": "c"})]);
        payload
            .context_mappings
            .insert("work".to_string(), vec!["jobs".to_string()]);

        assert_eq!(payload.tool_count(), 3);
        assert_eq!(payload.servers_for_context("work"), vec!["jobs"]);
        assert_eq!(payload.servers_for_context("other"), vec!["jobs", "weather"]);
    }

    #[test]
    fn test_expects_reply() {
        assert!(MessageType::ToolCall.expects_reply());
        assert!(MessageType::MasterToolCall.expects_reply());
        assert!(!MessageType::Heartbeat.expects_reply());
    }
}
