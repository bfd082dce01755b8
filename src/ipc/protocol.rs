//! IPC wire protocol — parsing, validation and construction of daemon
//! messages.
//!
//! The parser is the sole producer of [`IpcMessage`] values from the wire:
//! every inbound frame goes through [`parse`], which validates the
//! discriminator and per-type required fields and trims every string field.
//! Builders for outbound messages omit optional fields that are empty after
//! trim.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Error codes carried on outbound `error` messages.
pub const ERR_INVALID_JSON: &str = "invalid_json";
pub const ERR_INVALID_MESSAGE: &str = "invalid_message";
pub const ERR_UNSUPPORTED_TYPE: &str = "unsupported_type";

/// A validated IPC message. String fields are trimmed and non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcMessage {
    #[serde(rename_all = "camelCase")]
    Hello {
        client_id: String,
        sent_at: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        instance_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        platform: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    HelloAck {
        connection_id: String,
        server_time: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_version: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat { sent_at: String },
    #[serde(rename_all = "camelCase")]
    Event {
        event_type: String,
        event_id: String,
        sent_at: String,
        payload: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    Command {
        command_id: String,
        name: String,
        issued_at: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Map<String, Value>>,
    },
    #[serde(rename_all = "camelCase")]
    CommandResult {
        command_id: String,
        ok: bool,
        responded_at: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Map<String, Value>>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        sent_at: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl IpcMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            IpcMessage::Hello { .. } => "hello",
            IpcMessage::HelloAck { .. } => "hello_ack",
            IpcMessage::Heartbeat { .. } => "heartbeat",
            IpcMessage::Event { .. } => "event",
            IpcMessage::Command { .. } => "command",
            IpcMessage::CommandResult { .. } => "command_result",
            IpcMessage::Error { .. } => "error",
        }
    }

    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ─── Field helpers ────────────────────────────────────────────────────────────

fn required_string(obj: &Map<String, Value>, key: &str) -> Result<String, String> {
    match obj.get(key) {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Err(format!("field '{key}' must be a non-empty string"))
            } else {
                Ok(trimmed.to_string())
            }
        }
        Some(_) => Err(format!("field '{key}' must be a string")),
        None => Err(format!("missing required field '{key}'")),
    }
}

fn optional_string(obj: &Map<String, Value>, key: &str) -> Result<Option<String>, String> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            Ok(if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            })
        }
        Some(_) => Err(format!("field '{key}' must be a string")),
    }
}

fn required_bool(obj: &Map<String, Value>, key: &str) -> Result<bool, String> {
    match obj.get(key) {
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(format!("field '{key}' must be a boolean")),
        None => Err(format!("missing required field '{key}'")),
    }
}

/// Payloads must be plain JSON objects; arrays and scalars are rejected.
fn required_object(obj: &Map<String, Value>, key: &str) -> Result<Map<String, Value>, String> {
    match obj.get(key) {
        Some(Value::Object(m)) => Ok(m.clone()),
        Some(_) => Err(format!("field '{key}' must be an object")),
        None => Err(format!("missing required field '{key}'")),
    }
}

fn optional_object(
    obj: &Map<String, Value>,
    key: &str,
) -> Result<Option<Map<String, Value>>, String> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(m)) => Ok(Some(m.clone())),
        Some(_) => Err(format!("field '{key}' must be an object")),
    }
}

// ─── Parsing ──────────────────────────────────────────────────────────────────

/// Parse and validate one inbound frame that already decoded as JSON.
pub fn parse_value(value: &Value) -> Result<IpcMessage, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "message must be a JSON object".to_string())?;

    let msg_type = required_string(obj, "type")?;

    match msg_type.as_str() {
        "hello" => Ok(IpcMessage::Hello {
            client_id: required_string(obj, "clientId")?,
            sent_at: required_string(obj, "sentAt")?,
            instance_id: optional_string(obj, "instanceId")?,
            platform: optional_string(obj, "platform")?,
        }),
        "hello_ack" => Ok(IpcMessage::HelloAck {
            connection_id: required_string(obj, "connectionId")?,
            server_time: required_string(obj, "serverTime")?,
            server_version: optional_string(obj, "serverVersion")?,
        }),
        "heartbeat" => Ok(IpcMessage::Heartbeat {
            sent_at: required_string(obj, "sentAt")?,
        }),
        "event" => Ok(IpcMessage::Event {
            event_type: required_string(obj, "eventType")?,
            event_id: required_string(obj, "eventId")?,
            sent_at: required_string(obj, "sentAt")?,
            payload: required_object(obj, "payload")?,
        }),
        "command" => Ok(IpcMessage::Command {
            command_id: required_string(obj, "commandId")?,
            name: required_string(obj, "name")?,
            issued_at: required_string(obj, "issuedAt")?,
            payload: optional_object(obj, "payload")?,
        }),
        "command_result" => Ok(IpcMessage::CommandResult {
            command_id: required_string(obj, "commandId")?,
            ok: required_bool(obj, "ok")?,
            responded_at: required_string(obj, "respondedAt")?,
            error: optional_string(obj, "error")?,
            result: optional_object(obj, "result")?,
        }),
        "error" => Ok(IpcMessage::Error {
            message: required_string(obj, "message")?,
            sent_at: required_string(obj, "sentAt")?,
            code: optional_string(obj, "code")?,
        }),
        other => Err(format!("Unsupported IPC message type: {other}")),
    }
}

/// Parse raw frame text: JSON decode, then protocol validation.
pub fn parse(raw: &str) -> Result<IpcMessage, String> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}"))?;
    parse_value(&value)
}

// ─── Builders ─────────────────────────────────────────────────────────────────

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn build_hello_ack(connection_id: &str, server_version: Option<&str>) -> IpcMessage {
    IpcMessage::HelloAck {
        connection_id: connection_id.to_string(),
        server_time: now_iso(),
        server_version: non_empty(server_version),
    }
}

/// Build a `command` with a fresh command id. Returns the id alongside the
/// message so the dispatcher can report it.
pub fn build_command(name: &str, payload: Option<Map<String, Value>>) -> (String, IpcMessage) {
    let command_id = Uuid::new_v4().to_string();
    let msg = IpcMessage::Command {
        command_id: command_id.clone(),
        name: name.trim().to_string(),
        issued_at: now_iso(),
        payload: payload.filter(|p| !p.is_empty()),
    };
    (command_id, msg)
}

pub fn build_error(code: Option<&str>, message: &str) -> IpcMessage {
    IpcMessage::Error {
        message: message.trim().to_string(),
        sent_at: now_iso(),
        code: non_empty(code),
    }
}
