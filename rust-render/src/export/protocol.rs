//! Bridge wire protocol.
//!
//! Commands travel as `{"method": "...", "data": ...}`; every command is
//! answered by exactly one [`AckMessage`] on a separate channel.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::encoder::EncoderSettings;

pub const METHOD_START: &str = "start";
pub const METHOD_HANDLE_FRAME: &str = "handleFrame";
pub const METHOD_END: &str = "end";

/// What the producer reports when it stops sending frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderResult {
    /// Number of frames the producer submitted, checked against what the
    /// session actually forwarded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames: Option<u64>,
}

/// Typed bridge command.
#[derive(Debug, Clone)]
pub enum ExportCommand {
    Start(EncoderSettings),
    HandleFrame(Bytes),
    End(RenderResult),
}

impl ExportCommand {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Start(_) => METHOD_START,
            Self::HandleFrame(_) => METHOD_HANDLE_FRAME,
            Self::End(_) => METHOD_END,
        }
    }
}

/// Untyped command as it arrives off the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCommand {
    pub method: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RawCommand {
    pub fn new(method: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            data,
        }
    }

    /// Decode into a typed command. The error is the acknowledgment message.
    ///
    /// `handleFrame` data is a base64 string of raw RGBA8 bytes.
    pub fn decode(self) -> Result<ExportCommand, String> {
        match self.method.as_str() {
            METHOD_START => serde_json::from_value(self.data)
                .map(ExportCommand::Start)
                .map_err(|e| format!("invalid start settings: {}", e)),
            METHOD_HANDLE_FRAME => {
                let encoded = self
                    .data
                    .as_str()
                    .ok_or_else(|| "frame data must be a base64 string".to_string())?;
                BASE64
                    .decode(encoded)
                    .map(|raw| ExportCommand::HandleFrame(Bytes::from(raw)))
                    .map_err(|e| format!("invalid frame data: {}", e))
            }
            METHOD_END => {
                if self.data.is_null() {
                    return Ok(ExportCommand::End(RenderResult::default()));
                }
                serde_json::from_value(self.data)
                    .map(ExportCommand::End)
                    .map_err(|e| format!("invalid render result: {}", e))
            }
            other => Err(format!("unknown method: {}", other)),
        }
    }
}

impl From<&ExportCommand> for RawCommand {
    fn from(cmd: &ExportCommand) -> Self {
        let data = match cmd {
            ExportCommand::Start(settings) => serde_json::to_value(settings).unwrap_or_default(),
            ExportCommand::HandleFrame(frame) => serde_json::Value::String(BASE64.encode(frame)),
            ExportCommand::End(result) => serde_json::to_value(result).unwrap_or_default(),
        };
        Self::new(cmd.method(), data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AckStatus {
    Success {
        #[serde(default)]
        data: serde_json::Value,
    },
    Error {
        message: String,
    },
}

/// Acknowledgment for one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckMessage {
    pub call_id: u64,
    pub method: String,
    #[serde(flatten)]
    pub status: AckStatus,
}

impl AckMessage {
    pub fn success(call_id: u64, method: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            call_id,
            method: method.into(),
            status: AckStatus::Success { data },
        }
    }

    pub fn error(call_id: u64, method: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            call_id,
            method: method.into(),
            status: AckStatus::Error {
                message: message.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, AckStatus::Success { .. })
    }

    pub fn message(&self) -> Option<&str> {
        match &self.status {
            AckStatus::Error { message } => Some(message),
            AckStatus::Success { .. } => None,
        }
    }
}
