use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::repo_tx::StorageTx;
use chrono::{DateTime, Utc};

/// Durable append-only message log, sequence-scoped per conversation.
///
/// `append_in_tx` is also the sequence allocator: the next sequence is
/// derived from the persisted log inside the same transaction as the
/// insert, so a crash between "allocate" and "persist" cannot leave a
/// hole visible to `get_after_in_tx`.
#[async_trait::async_trait]
pub trait MessageRepo: Send + Sync {
    async fn append_in_tx<'t>(
        &self,
        tx: &mut dyn StorageTx<'t>,
        conversation_id: ConversationId,
        recipient: ConversationKey,
        message_id: MessageId,
        sender: UserId,
        kind: MessageKind,
        content: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRecord, ChatError>;

    /// Messages with `sequence > after`, ascending, at most `limit`, plus
    /// the conversation's current max sequence.
    async fn get_after_in_tx<'t>(
        &self,
        tx: &mut dyn StorageTx<'t>,
        conversation_id: ConversationId,
        after: SequenceNumber,
        limit: u32,
    ) -> Result<CatchUpPage, ChatError>;

    async fn get_by_id_in_tx<'t>(
        &self,
        tx: &mut dyn StorageTx<'t>,
        message_id: MessageId,
    ) -> Result<Option<MessageRecord>, ChatError>;

    async fn set_content_in_tx<'t>(
        &self,
        tx: &mut dyn StorageTx<'t>,
        message_id: MessageId,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<(), ChatError>;

    /// Logical delete: blanks the content and stamps `recalled_at`, leaving
    /// id and sequence in place so catch-up sees a recall marker.
    async fn tombstone_in_tx<'t>(
        &self,
        tx: &mut dyn StorageTx<'t>,
        message_id: MessageId,
        recalled_at: DateTime<Utc>,
    ) -> Result<(), ChatError>;

    /// Monotonic upsert of the reader's high-water mark; marking the same
    /// or an earlier point again is a no-op.
    async fn upsert_read_marker_in_tx<'t>(
        &self,
        tx: &mut dyn StorageTx<'t>,
        conversation_id: ConversationId,
        reader: UserId,
        up_to: SequenceNumber,
    ) -> Result<(), ChatError>;

    async fn read_marker_in_tx<'t>(
        &self,
        tx: &mut dyn StorageTx<'t>,
        conversation_id: ConversationId,
        reader: UserId,
    ) -> Result<SequenceNumber, ChatError>;
}
