use crate::domain_model::*;
use crate::domain_port::repo_tx::StorageTx;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct EventId(pub uuid::Uuid);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "chat.message.new")]
    ChatMessageNew,
    #[serde(rename = "chat.message.edited")]
    ChatMessageEdited,
    #[serde(rename = "chat.message.recalled")]
    ChatMessageRecalled,
}

/// One not-yet-published domain event, written in the same transaction as
/// the state change it announces. `attempt_count` only moves forward; an
/// entry is terminal once `published_at` or `failed_at` is set.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub event_id: EventId,
    pub event_type: EventType,
    pub partition_key: Option<uuid::Uuid>,

    pub receivers_json: serde_json::Value,
    pub payload_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl OutboxEvent {
    pub fn new<T: Serialize>(
        event_type: EventType,
        partition_key: Option<uuid::Uuid>,
        receivers: Vec<UserId>,
        payload: &T,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            event_id: EventId(uuid::Uuid::new_v4()),
            event_type,
            partition_key,
            receivers_json: serde_json::to_value(receivers)?,
            payload_json: serde_json::to_value(payload)?,
            created_at: Utc::now(),
            attempt_count: 0,
        })
    }
}

#[async_trait::async_trait]
pub trait OutboxRepo: Send + Sync {
    async fn enqueue_in_tx<'t>(
        &self,
        tx: &mut dyn StorageTx<'t>,
        event: &OutboxEvent,
    ) -> anyhow::Result<()>;

    /// Claims up to `limit` pending entries ready at `now`. The claim must
    /// be exclusive across dispatcher instances for the life of the
    /// transaction (row locks in MySQL, the tx lock in the memory backend).
    async fn claim_ready_batch_in_tx<'t>(
        &self,
        tx: &mut dyn StorageTx<'t>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> anyhow::Result<Vec<OutboxEvent>>;

    async fn mark_published_in_tx<'t>(
        &self,
        tx: &mut dyn StorageTx<'t>,
        event_id: EventId,
        published_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn reschedule_in_tx<'t>(
        &self,
        tx: &mut dyn StorageTx<'t>,
        event_id: EventId,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> anyhow::Result<()>;

    /// Dead-letters the entry; it is never claimed again.
    async fn mark_failed_in_tx<'t>(
        &self,
        tx: &mut dyn StorageTx<'t>,
        event_id: EventId,
        failed_at: DateTime<Utc>,
        last_error: &str,
    ) -> anyhow::Result<()>;
}
