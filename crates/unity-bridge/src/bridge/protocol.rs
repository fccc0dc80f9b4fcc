//! Message types exchanged with a Unity peer.
//!
//! Requests go out as `{"type": ..., "params": ...}`; a keepalive goes out
//! as the bare bytes `ping`. Responses come back as
//! `{"status": "success", "result": ...}` or
//! `{"status": "error", "error"|"message": ..., ...}`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{CommandError, TransportError};

/// Raw keepalive payload, identical in both wire modes.
pub const PING_PAYLOAD: &[u8] = b"ping";

/// Body of a command request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub params: Value,
}

/// Messages from this bridge to a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerRequest {
    Ping,
    Command(CommandFrame),
}

impl PeerRequest {
    pub fn command(command_type: impl Into<String>, params: Value) -> Self {
        Self::Command(CommandFrame {
            command_type: command_type.into(),
            params,
        })
    }

    pub fn is_ping(&self) -> bool {
        matches!(self, Self::Ping)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Ping => "ping",
            Self::Command(frame) => &frame.command_type,
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Ping => Ok(PING_PAYLOAD.to_vec()),
            Self::Command(frame) => serde_json::to_vec(frame),
        }
    }
}

/// Messages from a peer to this bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PeerResponse {
    Success {
        #[serde(default)]
        result: Value,
    },

    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// `"reloading"` while the editor is mid domain reload.
        #[serde(skip_serializing_if = "Option::is_none")]
        state: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

/// Lenient shape used for decoding: peers omit or vary fields freely, and
/// anything without `status: "error"` is treated as success.
#[derive(Deserialize)]
struct RawResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    retry_after_ms: Option<u64>,
    #[serde(default)]
    data: Option<Value>,
}

fn text_of(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

impl PeerResponse {
    pub fn success(result: Value) -> Self {
        Self::Success { result }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: Some(message.into()),
            message: None,
            state: None,
            retry_after_ms: None,
            data: None,
        }
    }

    pub fn reloading(retry_after_ms: u64) -> Self {
        Self::Error {
            error: Some("Unity domain reload in progress".to_string()),
            message: None,
            state: Some("reloading".to_string()),
            retry_after_ms: Some(retry_after_ms),
            data: None,
        }
    }

    /// Decode one response payload. An empty payload is the result of a
    /// heartbeat-only read and decodes as an empty success.
    pub fn decode(payload: &[u8]) -> Result<Self, TransportError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::success(json!({})));
        }
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, TransportError> {
        let raw: RawResponse =
            serde_json::from_value(value).map_err(|e| TransportError::Protocol(e.to_string()))?;

        if raw.status.as_deref() != Some("error") {
            return Ok(Self::Success {
                result: raw.result.unwrap_or_else(|| json!({})),
            });
        }

        Ok(Self::Error {
            error: text_of(raw.error),
            message: text_of(raw.message),
            state: raw.state,
            retry_after_ms: raw.retry_after_ms,
            data: raw.data,
        })
    }

    pub fn is_pong(&self) -> bool {
        match self {
            Self::Success { result } => {
                result.get("message").and_then(Value::as_str) == Some("pong")
            }
            Self::Error { .. } => false,
        }
    }

    /// Text the peer gave for an error response.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Error { error, message, .. } => error.as_deref().or(message.as_deref()),
        }
    }

    /// True when the peer says it is mid domain reload, either through an
    /// explicit state marker or through its error text.
    pub fn is_reloading(&self) -> bool {
        let Self::Error { state, data, .. } = self else {
            return false;
        };
        if state.as_deref() == Some("reloading") {
            return true;
        }
        let data_marker = data.as_ref().is_some_and(|d| {
            d.get("state").and_then(Value::as_str) == Some("reloading")
                || d.get("reason").and_then(Value::as_str) == Some("reloading")
        });
        data_marker
            || self
                .error_message()
                .is_some_and(|m| m.to_ascii_lowercase().contains("reload"))
    }

    /// Peer-advised wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        let Self::Error {
            retry_after_ms,
            data,
            ..
        } = self
        else {
            return None;
        };
        retry_after_ms
            .or_else(|| {
                data.as_ref()
                    .and_then(|d| d.get("retry_after_ms"))
                    .and_then(Value::as_u64)
            })
            .map(Duration::from_millis)
    }

    /// Convert into the command result for `request`.
    pub fn into_result(self, request: &PeerRequest) -> Result<Value, CommandError> {
        if request.is_ping() {
            return if self.is_pong() {
                Ok(json!({ "message": "pong" }))
            } else {
                Err(CommandError::peer("Ping unsuccessful"))
            };
        }

        if self.is_reloading() {
            let message = self
                .error_message()
                .unwrap_or("Unity domain reload in progress")
                .to_string();
            return Err(CommandError::reloading(message, self.retry_after()));
        }

        match self {
            Self::Success { result } => Ok(result),
            Self::Error { .. } => Err(CommandError::peer(
                self.error_message().unwrap_or("Unknown Unity error"),
            )),
        }
    }
}
