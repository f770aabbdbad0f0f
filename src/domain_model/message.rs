use crate::domain_model::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(
    Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct MessageId(pub uuid::Uuid);

/// Conversation-scoped position, 1-based, strictly increasing, gap-free.
#[derive(
    Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);
}

impl FromStr for SequenceNumber {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let seq = s.parse::<u64>().map_err(|e| e.to_string())?;
        Ok(Self(seq))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
    System,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    /// The recipient as addressed by the sender; kept on the record so
    /// edit/recall fan-out can resolve receivers without the original key.
    pub recipient: ConversationKey,
    pub sequence: SequenceNumber,
    pub sender: UserId,
    pub kind: MessageKind,
    /// Empty once the message has been recalled.
    pub content: String,
    pub reply_to: Option<MessageId>,
    pub sent_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub recalled_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    pub fn is_recalled(&self) -> bool {
        self.recalled_at.is_some()
    }
}

/// Catch-up page: everything after the client's cursor plus the current
/// high-water mark, so the client knows when to stop paging.
#[derive(Debug, Clone, Serialize)]
pub struct CatchUpPage {
    pub messages: Vec<MessageRecord>,
    pub max_sequence: SequenceNumber,
}
