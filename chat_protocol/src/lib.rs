//! Wire types shared between the chat server and its clients.
//!
//! Identifiers are normalized once, when they cross into the process, so the
//! rest of the code compares typed ids instead of ad hoc strings.

mod events;
mod model;

pub use events::{
    ClientEvent, ConversationRef, ErrorCode, ErrorNotice, FrameError, ReadReceipt, ReadUpdate,
    Ready, SendAck, SendMessage, ServerEvent, TypingNotice, TypingUpdate,
};
pub use model::{
    Conversation, ConversationKind, ConversationView, FileContent, ImageContent, Message,
    MessageBody, MessageKind, Page, ReadState, TextContent, UserProfile,
};

use serde::{Deserialize, Deserializer, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Failure to turn raw input into a typed identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("identifier must not be empty")]
    Empty,
    #[error("malformed identifier `{0}`")]
    Malformed(String),
}

/// Canonical user identifier.
///
/// Accounts live in another service which may hand out numeric or string
/// ids; both are accepted on input and always stored as trimmed strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawUserId {
    Text(String),
    Number(u64),
}

impl UserId {
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, IdError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(IdError::Empty);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawUserId::deserialize(deserializer)? {
            RawUserId::Text(s) => Self::parse(s).map_err(serde::de::Error::custom),
            RawUserId::Number(n) => Ok(Self(n.to_string())),
        }
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl FromStr for UserId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(raw: &str) -> Result<Self, IdError> {
                Uuid::parse_str(raw.trim())
                    .map(Self)
                    .map_err(|_| IdError::Malformed(raw.to_string()))
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a conversation.
    ConversationId
);
uuid_id!(
    /// Identifier of a message.
    MessageId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_ids_are_trimmed_and_non_empty() {
        assert_eq!(UserId::parse("  alice ").unwrap().as_str(), "alice");
        assert_eq!(UserId::parse("   "), Err(IdError::Empty));
    }

    #[test]
    fn numeric_user_ids_coerce_to_strings() {
        let ids: Vec<UserId> = serde_json::from_str(r#"[42, "42", " bob "]"#).unwrap();
        assert_eq!(ids[0], ids[1]);
        assert_eq!(ids[2].as_str(), "bob");
        assert_eq!(serde_json::to_string(&ids[0]).unwrap(), r#""42""#);
    }

    #[test]
    fn malformed_uuid_ids_are_rejected() {
        assert!(ConversationId::parse("not-a-uuid").is_err());
        let id = MessageId::new();
        assert_eq!(MessageId::parse(&id.to_string()).unwrap(), id);
    }
}
