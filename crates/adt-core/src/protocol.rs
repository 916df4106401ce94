use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_ENVELOPE_BYTES: usize = 256 * 1024;

pub type CommandId = i64;
pub type AgentId = i64;

/// Wire tag carried in the `type` field of every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Error,
    ExecuteCommand,
    ExecuteCommandResponse,
    ExecuteRecurringCommand,
    ExecuteRecurringCommandResponse,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::Error,
        MessageKind::ExecuteCommand,
        MessageKind::ExecuteCommandResponse,
        MessageKind::ExecuteRecurringCommand,
        MessageKind::ExecuteRecurringCommandResponse,
    ];

    pub fn tag(self) -> i64 {
        match self {
            MessageKind::Error => -1,
            MessageKind::ExecuteCommand => 1,
            MessageKind::ExecuteCommandResponse => 2,
            MessageKind::ExecuteRecurringCommand => 3,
            MessageKind::ExecuteRecurringCommandResponse => 4,
        }
    }

    pub fn from_tag(tag: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Error => "error",
            MessageKind::ExecuteCommand => "execute_command",
            MessageKind::ExecuteCommandResponse => "execute_command_response",
            MessageKind::ExecuteRecurringCommand => "execute_recurring_command",
            MessageKind::ExecuteRecurringCommandResponse => "execute_recurring_command_response",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteCommand {
    pub id: CommandId,
    pub command: String,
}

/// Result of one execution, shared by the one-shot and recurring response tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub id: CommandId,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRecurringCommand {
    pub id: CommandId,
    pub command: String,
    /// Seconds between executions.
    pub interval: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Error(ErrorPayload),
    ExecuteCommand(ExecuteCommand),
    ExecuteCommandResponse(CommandOutput),
    ExecuteRecurringCommand(ExecuteRecurringCommand),
    ExecuteRecurringCommandResponse(CommandOutput),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("envelope exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown message type {0}")]
    UnknownType(i64),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageKind, reason: String },
    #[error("envelope encode failed: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Code carried by the `Error` envelope sent back in strict mode.
    pub fn code(&self) -> i64 {
        match self {
            ProtocolError::Oversized { .. } => 413,
            ProtocolError::Malformed(_) => 400,
            ProtocolError::UnknownType(_) => 404,
            ProtocolError::InvalidPayload { .. } => 422,
            ProtocolError::Encode(_) => 500,
        }
    }
}

impl Envelope {
    pub fn kind(&self) -> MessageKind {
        match self {
            Envelope::Error(_) => MessageKind::Error,
            Envelope::ExecuteCommand(_) => MessageKind::ExecuteCommand,
            Envelope::ExecuteCommandResponse(_) => MessageKind::ExecuteCommandResponse,
            Envelope::ExecuteRecurringCommand(_) => MessageKind::ExecuteRecurringCommand,
            Envelope::ExecuteRecurringCommandResponse(_) => {
                MessageKind::ExecuteRecurringCommandResponse
            }
        }
    }

    /// Command id the envelope correlates with, if any.
    pub fn command_id(&self) -> Option<CommandId> {
        match self {
            Envelope::Error(_) => None,
            Envelope::ExecuteCommand(payload) => Some(payload.id),
            Envelope::ExecuteRecurringCommand(payload) => Some(payload.id),
            Envelope::ExecuteCommandResponse(payload)
            | Envelope::ExecuteRecurringCommandResponse(payload) => Some(payload.id),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|err| ProtocolError::Encode(err.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Self::decode_with_limit(text, DEFAULT_MAX_ENVELOPE_BYTES)
    }

    pub fn decode_with_limit(text: &str, max_bytes: usize) -> Result<Self, ProtocolError> {
        if text.len() > max_bytes {
            return Err(ProtocolError::Oversized {
                size: text.len(),
                max: max_bytes,
            });
        }
        let raw: RawEnvelope<'_> =
            serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
        let kind = MessageKind::from_tag(raw.tag).ok_or(ProtocolError::UnknownType(raw.tag))?;
        Self::from_parts(kind, raw.data.get())
    }

    fn from_parts(kind: MessageKind, data: &str) -> Result<Self, ProtocolError> {
        let invalid = |err: serde_json::Error| ProtocolError::InvalidPayload {
            kind,
            reason: err.to_string(),
        };
        let envelope = match kind {
            MessageKind::Error => Envelope::Error(serde_json::from_str(data).map_err(invalid)?),
            MessageKind::ExecuteCommand => {
                Envelope::ExecuteCommand(serde_json::from_str(data).map_err(invalid)?)
            }
            MessageKind::ExecuteCommandResponse => {
                Envelope::ExecuteCommandResponse(serde_json::from_str(data).map_err(invalid)?)
            }
            MessageKind::ExecuteRecurringCommand => {
                Envelope::ExecuteRecurringCommand(serde_json::from_str(data).map_err(invalid)?)
            }
            MessageKind::ExecuteRecurringCommandResponse => {
                Envelope::ExecuteRecurringCommandResponse(
                    serde_json::from_str(data).map_err(invalid)?,
                )
            }
        };
        Ok(envelope)
    }
}

impl Serialize for Envelope {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Envelope", 2)?;
        state.serialize_field("type", &self.kind().tag())?;
        match self {
            Envelope::Error(payload) => state.serialize_field("data", payload)?,
            Envelope::ExecuteCommand(payload) => state.serialize_field("data", payload)?,
            Envelope::ExecuteRecurringCommand(payload) => state.serialize_field("data", payload)?,
            Envelope::ExecuteCommandResponse(payload)
            | Envelope::ExecuteRecurringCommandResponse(payload) => {
                state.serialize_field("data", payload)?
            }
        }
        state.end()
    }
}

#[derive(Deserialize)]
struct RawEnvelope<'a> {
    #[serde(rename = "type")]
    tag: i64,
    #[serde(borrow)]
    data: &'a RawValue,
}

/// What a peer does with an inbound frame that fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseFailurePolicy {
    /// Log locally and send nothing back.
    #[default]
    Drop,
    /// Answer with an `Error` envelope describing the failure.
    Reply,
}

impl ParseFailurePolicy {
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            ParseFailurePolicy::Reply
        } else {
            ParseFailurePolicy::Drop
        }
    }

    pub fn reply_for(self, err: &ProtocolError) -> Option<Envelope> {
        match self {
            ParseFailurePolicy::Drop => None,
            ParseFailurePolicy::Reply => Some(Envelope::Error(ErrorPayload {
                code: err.code(),
                message: err.to_string(),
            })),
        }
    }
}
