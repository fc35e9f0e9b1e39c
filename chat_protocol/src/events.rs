use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ConversationId, Message, MessageBody, MessageId, UserId};

/// Events a connected client may emit. Frames are
/// `{"event": "<NAME>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
    ConvJoin(ConversationRef),
    ConvLeave(ConversationRef),
    MsgSend(SendMessage),
    ReadUpdate(ReadUpdate),
    Typing(TypingUpdate),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConvJoin(_) => "CONV_JOIN",
            Self::ConvLeave(_) => "CONV_LEAVE",
            Self::MsgSend(_) => "MSG_SEND",
            Self::ReadUpdate(_) => "READ_UPDATE",
            Self::Typing(_) => "TYPING",
        }
    }

    /// Decode a text frame. On failure the event name and `clientId` are
    /// salvaged when present so a failed send can still be acknowledged.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(|e| FrameError {
            event: None,
            client_id: None,
            reason: e.to_string(),
        })?;
        let event = value
            .get("event")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let client_id = value
            .get("data")
            .and_then(|d| d.get("clientId"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        serde_json::from_value(value).map_err(|e| FrameError {
            event,
            client_id,
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed frame: {reason}")]
pub struct FrameError {
    pub event: Option<String>,
    pub client_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub conversation_id: ConversationId,
    /// Correlation id chosen by the client for its optimistic UI.
    pub client_id: String,
    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadUpdate {
    pub conversation_id: ConversationId,
    pub last_read_message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdate {
    pub conversation_id: ConversationId,
    pub is_typing: bool,
}

/// Events pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    Ready(Ready),
    ConvJoined(ConversationRef),
    MsgNew(Message),
    MsgAck(SendAck),
    ReadUpdated(ReadReceipt),
    Typing(TypingNotice),
    Error(ErrorNotice),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    pub user_id: UserId,
}

/// Acknowledgement for a `MSG_SEND`, delivered only to the sending
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    pub client_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

impl SendAck {
    pub fn success(client_id: String, message: &Message) -> Self {
        Self {
            client_id,
            ok: true,
            message_id: Some(message.id),
            created_at: Some(message.created_at),
            error: None,
        }
    }

    pub fn failure(client_id: String, code: ErrorCode) -> Self {
        Self {
            client_id,
            ok: false,
            message_id: None,
            created_at: None,
            error: Some(code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub last_read_message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    InvalidArgument,
    Internal,
}

/// Error scoped to the connection that triggered it; never broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotice {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub code: ErrorCode,
    pub message: String,
}
