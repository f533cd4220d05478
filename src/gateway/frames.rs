//! Wire frames of the session channel.
//!
//! Every frame is one JSON object with a `type` discriminator. Clients send
//! `connect`, `input`, `resize` and `close`; the gateway sends `welcome`,
//! `ready`, `data`, `error`, `info` and `closing`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::provisioning::ContainerRef;

/// Frame types a client may send.
const CLIENT_TYPES: &[&str] = &["connect", "input", "resize", "close"];

/// Frame types only the gateway sends.
const SERVER_TYPES: &[&str] = &["welcome", "ready", "data", "error", "info", "closing"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Connect {
        token: String,
        #[serde(rename = "containerId", alias = "container_id")]
        container_id: ContainerRef,
    },
    Input {
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Close,
}

impl ClientFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Input { .. } => "input",
            Self::Resize { .. } => "resize",
            Self::Close => "close",
        }
    }
}

/// Decode one client frame, telling an unknown `type` apart from a known
/// type with bad fields.
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, GatewayError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| GatewayError::Protocol(format!("frame is not valid JSON: {e}")))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Protocol("frame has no type".to_string()))?;

    if SERVER_TYPES.contains(&kind) {
        return Err(GatewayError::Protocol(format!(
            "{kind} frames are sent by the gateway only"
        )));
    }
    if !CLIENT_TYPES.contains(&kind) {
        return Err(GatewayError::Protocol(format!("unknown frame type '{kind}'")));
    }

    let kind = kind.to_string();
    serde_json::from_value(value)
        .map_err(|e| GatewayError::Protocol(format!("malformed {kind} frame: {e}")))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Welcome {
        session_id: String,
        message: String,
    },
    Ready {
        container_id: i64,
        container_name: String,
        backend: String,
        supports_resize: bool,
    },
    Data {
        data: String,
    },
    Error {
        code: String,
        message: String,
    },
    Info {
        message: String,
    },
    Closing {
        reason: String,
    },
}

impl ServerFrame {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::Info {
            message: message.into(),
        }
    }

    pub fn closing(reason: impl Into<String>) -> Self {
        Self::Closing {
            reason: reason.into(),
        }
    }

    /// `error` frame describing a per-channel failure.
    pub fn from_error(err: &GatewayError) -> Self {
        Self::error(error_code(err), err.to_string())
    }

    pub fn to_json(&self) -> Result<String, GatewayError> {
        serde_json::to_string(self).map_err(|e| GatewayError::Protocol(e.to_string()))
    }
}

/// Stable machine-readable code for an error frame.
pub fn error_code(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::Auth(_) => "unauthorized",
        GatewayError::ContainerNotFound(_) => "not_found",
        GatewayError::Forbidden(_) => "forbidden",
        GatewayError::NotRunning { .. } => "not_running",
        GatewayError::BackendUnavailable(_) => "backend_unavailable",
        GatewayError::Spawn(_) => "spawn_failed",
        GatewayError::Io(_) => "io_error",
        GatewayError::Protocol(_) => "protocol_error",
    }
}

/// Close codes sent when the gateway ends a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    AuthFailed,
    IdleTimeout,
    OverCapacity,
}

impl CloseCode {
    pub fn code(&self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::AuthFailed => 4401,
            Self::IdleTimeout => 4408,
            Self::OverCapacity => 1013,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Normal => "session closed",
            Self::AuthFailed => "authentication failed",
            Self::IdleTimeout => "idle timeout",
            Self::OverCapacity => "too many sessions",
        }
    }
}
