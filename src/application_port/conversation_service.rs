use crate::domain_model::*;
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message not found")]
    MessageNotFound,
    #[error("user may not access conversation")]
    NotMember,
    #[error("only the sender may edit or recall a message")]
    NotAuthor,
    #[error("edit/recall window has expired")]
    WindowExpired,
    #[error("message already recalled")]
    AlreadyRecalled,
    #[error("store error: {0}")]
    Store(String),
}

#[async_trait::async_trait]
pub trait ConversationService: Send + Sync {
    /// Assigns the next sequence, persists the message and enqueues the
    /// `chat.message.new` outbox event, all in one transaction. Resending
    /// the same `message_id` returns the original record.
    async fn send_message(
        &self,
        sender: UserId,
        to: ConversationKey,
        message_id: MessageId,
        kind: MessageKind,
        content: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRecord, ChatError>;

    /// Offline catch-up: everything after the caller's cursor, ascending,
    /// capped at `limit` (settings default when omitted).
    async fn catch_up(
        &self,
        requester: UserId,
        to: ConversationKey,
        after: SequenceNumber,
        limit: Option<u32>,
    ) -> Result<CatchUpPage, ChatError>;

    async fn edit_message(
        &self,
        requester: UserId,
        message_id: MessageId,
        new_content: &str,
        now: DateTime<Utc>,
    ) -> Result<MessageRecord, ChatError>;

    async fn recall_message(
        &self,
        requester: UserId,
        message_id: MessageId,
        now: DateTime<Utc>,
    ) -> Result<MessageRecord, ChatError>;

    /// Idempotent: the stored marker only moves forward.
    async fn mark_read(
        &self,
        requester: UserId,
        to: ConversationKey,
        up_to: SequenceNumber,
    ) -> Result<(), ChatError>;
}
