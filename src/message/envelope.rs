use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Message;

/// Delivery status of a persisted envelope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    #[default]
    Scheduled,
    Succeeded,
    Failed,
}

impl MessageStatus {
    /// Name stored in the `StatusName` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Scheduled => "Scheduled",
            MessageStatus::Succeeded => "Succeeded",
            MessageStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageStatus::Scheduled)
    }

    /// Only `Scheduled` may move, and only into a terminal state.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        matches!(
            (self, next),
            (MessageStatus::Scheduled, MessageStatus::Succeeded)
                | (MessageStatus::Scheduled, MessageStatus::Failed)
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown message status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for MessageStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Scheduled" => Ok(MessageStatus::Scheduled),
            "Succeeded" => Ok(MessageStatus::Succeeded),
            "Failed" => Ok(MessageStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Persisted form of a message.
///
/// `content` is the serialized message (id, value, headers) as written to the
/// `Content` column. `payload` is the user value the transport puts on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: i64,
    pub version: String,
    pub name: String,
    pub content: String,
    pub retries: u32,
    pub added: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: MessageStatus,
    #[serde(skip)]
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Build a `Scheduled` envelope for `message` addressed to `route`.
    pub fn for_message(
        route: impl Into<String>,
        message: &Message,
        version: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        let content = serde_json::to_string(message)?;
        Ok(Self {
            id: message.id,
            version: version.into(),
            name: route.into(),
            content,
            retries: 0,
            added: Utc::now(),
            expires_at: None,
            status: MessageStatus::Scheduled,
            payload: message.value.clone(),
        })
    }

    /// Rebuild the caller's message from the stored `content`.
    pub fn message(&self) -> Result<Message, serde_json::Error> {
        serde_json::from_str(&self.content)
    }

    /// Restore `payload` from `content`, for envelopes read back from storage.
    pub fn with_payload_from_content(mut self) -> Result<Self, serde_json::Error> {
        self.payload = self.message()?.value;
        Ok(self)
    }

    /// JSON body sent to the broker.
    pub fn body(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.payload)
    }

    pub fn is_scheduled(&self) -> bool {
        self.status == MessageStatus::Scheduled
    }
}
