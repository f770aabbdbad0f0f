//! In-memory backends for the storage ports.
//!
//! `MemoryTxManager` hands out transactions that hold one shared lock, so
//! everything between `begin` and `commit` is serialized exactly like the
//! row-locked MySQL path. Writes land eagerly; rollback is not supported,
//! which is fine for the service flows (they only fail before writing).

use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

pub struct MemoryTxManager {
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryTxManager {
    pub fn new() -> Self {
        Self {
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

impl Default for MemoryTxManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TxManager for MemoryTxManager {
    async fn begin<'t>(&'t self) -> anyhow::Result<Box<dyn StorageTx<'t> + 't>> {
        let guard = self.lock.clone().lock_owned().await;
        Ok(Box::new(MemoryTx { _guard: guard }))
    }
}

pub struct MemoryTx {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait::async_trait]
impl<'t> StorageTx<'t> for MemoryTx {
    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct OutboxRow {
    event: OutboxEvent,
    next_attempt_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    logs: HashMap<ConversationId, Vec<MessageRecord>>,
    by_id: HashMap<MessageId, (ConversationId, usize)>,
    read_markers: HashMap<(ConversationId, UserId), SequenceNumber>,
    outbox: Vec<OutboxRow>,
    groups: HashMap<GroupId, Vec<UserId>>,
}

/// Shared backing store; clone the `Arc`-wrapped handle into each repo.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_group(&self, group: GroupId, members: Vec<UserId>) {
        self.inner.lock().unwrap().groups.insert(group, members);
    }

    /// Test hook: rewrite a message's sent_at so window expiry is checkable
    /// without sleeping.
    pub fn backdate(&self, message_id: MessageId, sent_at: DateTime<Utc>) {
        let mut state = self.inner.lock().unwrap();
        if let Some((conversation_id, idx)) = state.by_id.get(&message_id).copied() {
            if let Some(log) = state.logs.get_mut(&conversation_id) {
                log[idx].sent_at = sent_at;
            }
        }
    }

    pub fn outbox_snapshot(&self) -> Vec<OutboxEvent> {
        self.inner
            .lock()
            .unwrap()
            .outbox
            .iter()
            .map(|row| row.event.clone())
            .collect()
    }

    pub fn published_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .outbox
            .iter()
            .filter(|row| row.published_at.is_some())
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .outbox
            .iter()
            .filter(|row| row.failed_at.is_some())
            .count()
    }
}

pub struct MemoryMessageRepo {
    store: MemoryStore,
}

impl MemoryMessageRepo {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl MessageRepo for MemoryMessageRepo {
    async fn append_in_tx<'t>(
        &self,
        _tx: &mut dyn StorageTx<'t>,
        conversation_id: ConversationId,
        recipient: ConversationKey,
        message_id: MessageId,
        sender: UserId,
        kind: MessageKind,
        content: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRecord, ChatError> {
        let mut state = self.store.inner.lock().unwrap();
        let log = state.logs.entry(conversation_id).or_default();
        // next sequence comes from the log itself: max existing + 1
        let sequence = SequenceNumber(log.len() as u64 + 1);
        let record = MessageRecord {
            message_id,
            conversation_id,
            recipient,
            sequence,
            sender,
            kind,
            content: content.to_owned(),
            reply_to,
            sent_at: Utc::now(),
            edited_at: None,
            recalled_at: None,
        };
        log.push(record.clone());
        let idx = log.len() - 1;
        state.by_id.insert(message_id, (conversation_id, idx));
        Ok(record)
    }

    async fn get_after_in_tx<'t>(
        &self,
        _tx: &mut dyn StorageTx<'t>,
        conversation_id: ConversationId,
        after: SequenceNumber,
        limit: u32,
    ) -> Result<CatchUpPage, ChatError> {
        let state = self.store.inner.lock().unwrap();
        let log = state.logs.get(&conversation_id);
        let max_sequence = log
            .map(|l| SequenceNumber(l.len() as u64))
            .unwrap_or(SequenceNumber::ZERO);
        let messages = log
            .map(|l| {
                l.iter()
                    .filter(|m| m.sequence > after)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(CatchUpPage {
            messages,
            max_sequence,
        })
    }

    async fn get_by_id_in_tx<'t>(
        &self,
        _tx: &mut dyn StorageTx<'t>,
        message_id: MessageId,
    ) -> Result<Option<MessageRecord>, ChatError> {
        let state = self.store.inner.lock().unwrap();
        Ok(state
            .by_id
            .get(&message_id)
            .and_then(|(conversation_id, idx)| {
                state.logs.get(conversation_id).map(|log| log[*idx].clone())
            }))
    }

    async fn set_content_in_tx<'t>(
        &self,
        _tx: &mut dyn StorageTx<'t>,
        message_id: MessageId,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<(), ChatError> {
        let mut state = self.store.inner.lock().unwrap();
        let (conversation_id, idx) = *state
            .by_id
            .get(&message_id)
            .ok_or(ChatError::MessageNotFound)?;
        let log = state
            .logs
            .get_mut(&conversation_id)
            .ok_or(ChatError::MessageNotFound)?;
        log[idx].content = content.to_owned();
        log[idx].edited_at = Some(edited_at);
        Ok(())
    }

    async fn tombstone_in_tx<'t>(
        &self,
        _tx: &mut dyn StorageTx<'t>,
        message_id: MessageId,
        recalled_at: DateTime<Utc>,
    ) -> Result<(), ChatError> {
        let mut state = self.store.inner.lock().unwrap();
        let (conversation_id, idx) = *state
            .by_id
            .get(&message_id)
            .ok_or(ChatError::MessageNotFound)?;
        let log = state
            .logs
            .get_mut(&conversation_id)
            .ok_or(ChatError::MessageNotFound)?;
        log[idx].content.clear();
        log[idx].recalled_at = Some(recalled_at);
        Ok(())
    }

    async fn upsert_read_marker_in_tx<'t>(
        &self,
        _tx: &mut dyn StorageTx<'t>,
        conversation_id: ConversationId,
        reader: UserId,
        up_to: SequenceNumber,
    ) -> Result<(), ChatError> {
        let mut state = self.store.inner.lock().unwrap();
        let marker = state
            .read_markers
            .entry((conversation_id, reader))
            .or_insert(SequenceNumber::ZERO);
        if up_to > *marker {
            *marker = up_to;
        }
        Ok(())
    }

    async fn read_marker_in_tx<'t>(
        &self,
        _tx: &mut dyn StorageTx<'t>,
        conversation_id: ConversationId,
        reader: UserId,
    ) -> Result<SequenceNumber, ChatError> {
        let state = self.store.inner.lock().unwrap();
        Ok(state
            .read_markers
            .get(&(conversation_id, reader))
            .copied()
            .unwrap_or(SequenceNumber::ZERO))
    }
}

pub struct MemoryOutboxRepo {
    store: MemoryStore,
}

impl MemoryOutboxRepo {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl OutboxRepo for MemoryOutboxRepo {
    async fn enqueue_in_tx<'t>(
        &self,
        _tx: &mut dyn StorageTx<'t>,
        event: &OutboxEvent,
    ) -> anyhow::Result<()> {
        let mut state = self.store.inner.lock().unwrap();
        if state.outbox.iter().any(|r| r.event.event_id == event.event_id) {
            return Ok(());
        }
        state.outbox.push(OutboxRow {
            event: event.clone(),
            next_attempt_at: event.created_at,
            published_at: None,
            failed_at: None,
            last_error: None,
        });
        Ok(())
    }

    async fn claim_ready_batch_in_tx<'t>(
        &self,
        _tx: &mut dyn StorageTx<'t>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> anyhow::Result<Vec<OutboxEvent>> {
        let state = self.store.inner.lock().unwrap();
        let mut ready: Vec<&OutboxRow> = state
            .outbox
            .iter()
            .filter(|r| r.published_at.is_none() && r.failed_at.is_none() && r.next_attempt_at <= now)
            .collect();
        ready.sort_by_key(|r| r.event.created_at);
        Ok(ready
            .into_iter()
            .take(limit as usize)
            .map(|r| r.event.clone())
            .collect())
    }

    async fn mark_published_in_tx<'t>(
        &self,
        _tx: &mut dyn StorageTx<'t>,
        event_id: EventId,
        published_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut state = self.store.inner.lock().unwrap();
        if let Some(row) = state.outbox.iter_mut().find(|r| r.event.event_id == event_id) {
            row.published_at = Some(published_at);
            row.last_error = None;
        }
        Ok(())
    }

    async fn reschedule_in_tx<'t>(
        &self,
        _tx: &mut dyn StorageTx<'t>,
        event_id: EventId,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> anyhow::Result<()> {
        let mut state = self.store.inner.lock().unwrap();
        if let Some(row) = state.outbox.iter_mut().find(|r| r.event.event_id == event_id) {
            row.event.attempt_count += 1;
            row.next_attempt_at = next_attempt_at;
            row.last_error = Some(last_error.to_owned());
        }
        Ok(())
    }

    async fn mark_failed_in_tx<'t>(
        &self,
        _tx: &mut dyn StorageTx<'t>,
        event_id: EventId,
        failed_at: DateTime<Utc>,
        last_error: &str,
    ) -> anyhow::Result<()> {
        let mut state = self.store.inner.lock().unwrap();
        if let Some(row) = state.outbox.iter_mut().find(|r| r.event.event_id == event_id) {
            row.event.attempt_count += 1;
            row.failed_at = Some(failed_at);
            row.last_error = Some(last_error.to_owned());
        }
        Ok(())
    }
}

pub struct MemoryGroupRepo {
    store: MemoryStore,
}

impl MemoryGroupRepo {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    fn members(&self, group: GroupId) -> Vec<UserId> {
        self.store
            .inner
            .lock()
            .unwrap()
            .groups
            .get(&group)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl GroupRepo for MemoryGroupRepo {
    async fn membership_exists_in_tx<'t>(
        &self,
        _tx: &mut dyn StorageTx<'t>,
        group: GroupId,
        user: UserId,
    ) -> anyhow::Result<bool> {
        Ok(self.members(group).contains(&user))
    }

    async fn list_member_ids_in_tx<'t>(
        &self,
        _tx: &mut dyn StorageTx<'t>,
        group: GroupId,
    ) -> anyhow::Result<Vec<UserId>> {
        Ok(self.members(group))
    }

    async fn list_member_ids(&self, group: GroupId) -> anyhow::Result<Vec<UserId>> {
        Ok(self.members(group))
    }
}
