use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Edit/recall windows and the catch-up page cap, from `[chat]` settings.
#[derive(Debug, Clone, Copy)]
pub struct ChatPolicy {
    pub edit_window: Duration,
    pub recall_window: Duration,
    pub catch_up_limit: u32,
}

pub struct RealConversationService {
    message_repo: Arc<dyn MessageRepo>,
    group_repo: Arc<dyn GroupRepo>,
    outbox_repo: Arc<dyn OutboxRepo>,
    access: Arc<dyn AccessPolicy>,
    tx_manager: Arc<dyn TxManager>,
    policy: ChatPolicy,
}

impl RealConversationService {
    pub fn new(
        message_repo: Arc<dyn MessageRepo>,
        group_repo: Arc<dyn GroupRepo>,
        outbox_repo: Arc<dyn OutboxRepo>,
        access: Arc<dyn AccessPolicy>,
        tx_manager: Arc<dyn TxManager>,
        policy: ChatPolicy,
    ) -> Self {
        Self {
            message_repo,
            group_repo,
            outbox_repo,
            access,
            tx_manager,
            policy,
        }
    }

    async fn check_access(&self, user: UserId, to: &ConversationKey) -> Result<(), ChatError> {
        let allowed = self
            .access
            .can_access(user, to)
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?;
        if allowed { Ok(()) } else { Err(ChatError::NotMember) }
    }

    /// Everyone who should be pushed about a change to `record`. Direct
    /// conversations have exactly two parties; group membership comes from
    /// the group repo. New-message events exclude the sender because the
    /// originating device gets an ack and any other device can catch up, but
    /// edits and recalls must reach the actor's other devices too, so those
    /// pass `exclude: None`.
    async fn receivers_for<'t>(
        &self,
        tx: &mut dyn StorageTx<'t>,
        record: &MessageRecord,
        exclude: Option<UserId>,
    ) -> Result<Vec<UserId>, ChatError> {
        let members = match record.recipient.kind {
            PeerKind::User => vec![record.sender, UserId(record.recipient.peer_id)],
            PeerKind::Group => self
                .group_repo
                .list_member_ids_in_tx(tx, GroupId(record.recipient.peer_id))
                .await
                .map_err(|e| ChatError::Store(format!("query group members: {e}")))?,
        };
        Ok(members
            .into_iter()
            .filter(|m| Some(*m) != exclude)
            .collect())
    }
}

#[async_trait::async_trait]
impl ConversationService for RealConversationService {
    async fn send_message(
        &self,
        sender: UserId,
        to: ConversationKey,
        message_id: MessageId,
        kind: MessageKind,
        content: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRecord, ChatError> {
        self.check_access(sender, &to).await?;

        let conversation_id = to.conversation_id(sender);

        let mut tx = self
            .tx_manager
            .begin()
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?;

        // Resend with a known message_id replays the original record and
        // must not enqueue a second outbox event.
        if let Some(existing) = self.message_repo.get_by_id_in_tx(&mut *tx, message_id).await? {
            tracing::debug!("duplicate send for message {}", message_id.0);
            tx.commit()
                .await
                .map_err(|e| ChatError::Store(e.to_string()))?;
            return Ok(existing);
        }

        let record = self
            .message_repo
            .append_in_tx(
                &mut *tx,
                conversation_id,
                to,
                message_id,
                sender,
                kind,
                content,
                reply_to,
            )
            .await?;

        let receivers = self.receivers_for(&mut *tx, &record, Some(sender)).await?;

        let event = OutboxEvent::new(
            EventType::ChatMessageNew,
            Some(conversation_id.0),
            receivers,
            &S2CEvent::ChatMessageNew(ChatMessageNew {
                conversation_id: record.conversation_id,
                message_id: record.message_id,
                sequence: record.sequence,
                sender: record.sender,
                kind: record.kind,
                content: record.content.clone(),
                reply_to: record.reply_to,
                sent_at: record.sent_at,
            }),
        )
        .map_err(|e| ChatError::Store(format!("compose chat.message.new event: {e}")))?;
        self.outbox_repo
            .enqueue_in_tx(&mut *tx, &event)
            .await
            .map_err(|e| ChatError::Store(format!("enqueue chat.message.new event: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?;

        Ok(record)
    }

    async fn catch_up(
        &self,
        requester: UserId,
        to: ConversationKey,
        after: SequenceNumber,
        limit: Option<u32>,
    ) -> Result<CatchUpPage, ChatError> {
        self.check_access(requester, &to).await?;

        let cap = self.policy.catch_up_limit;
        let limit = limit.unwrap_or(cap).min(cap);
        let conversation_id = to.conversation_id(requester);

        let mut tx = self
            .tx_manager
            .begin()
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?;

        let page = self
            .message_repo
            .get_after_in_tx(&mut *tx, conversation_id, after, limit)
            .await?;

        tx.commit()
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?;

        Ok(page)
    }

    async fn edit_message(
        &self,
        requester: UserId,
        message_id: MessageId,
        new_content: &str,
        now: DateTime<Utc>,
    ) -> Result<MessageRecord, ChatError> {
        let mut tx = self
            .tx_manager
            .begin()
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?;

        let mut record = self
            .message_repo
            .get_by_id_in_tx(&mut *tx, message_id)
            .await?
            .ok_or(ChatError::MessageNotFound)?;

        if record.sender != requester {
            return Err(ChatError::NotAuthor);
        }
        if record.is_recalled() {
            return Err(ChatError::AlreadyRecalled);
        }
        if now - record.sent_at > self.policy.edit_window {
            return Err(ChatError::WindowExpired);
        }

        self.message_repo
            .set_content_in_tx(&mut *tx, message_id, new_content, now)
            .await?;
        record.content = new_content.to_owned();
        record.edited_at = Some(now);

        let receivers = self.receivers_for(&mut *tx, &record, None).await?;
        let event = OutboxEvent::new(
            EventType::ChatMessageEdited,
            Some(record.conversation_id.0),
            receivers,
            &S2CEvent::ChatMessageEdited(ChatMessageEdited {
                conversation_id: record.conversation_id,
                message_id: record.message_id,
                sequence: record.sequence,
                content: record.content.clone(),
                edited_at: now,
            }),
        )
        .map_err(|e| ChatError::Store(format!("compose chat.message.edited event: {e}")))?;
        self.outbox_repo
            .enqueue_in_tx(&mut *tx, &event)
            .await
            .map_err(|e| ChatError::Store(format!("enqueue chat.message.edited event: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?;

        Ok(record)
    }

    async fn recall_message(
        &self,
        requester: UserId,
        message_id: MessageId,
        now: DateTime<Utc>,
    ) -> Result<MessageRecord, ChatError> {
        let mut tx = self
            .tx_manager
            .begin()
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?;

        let mut record = self
            .message_repo
            .get_by_id_in_tx(&mut *tx, message_id)
            .await?
            .ok_or(ChatError::MessageNotFound)?;

        if record.sender != requester {
            return Err(ChatError::NotAuthor);
        }
        if record.is_recalled() {
            // recalling twice settles on the same tombstone
            tx.commit()
                .await
                .map_err(|e| ChatError::Store(e.to_string()))?;
            return Ok(record);
        }
        if now - record.sent_at > self.policy.recall_window {
            return Err(ChatError::WindowExpired);
        }

        self.message_repo
            .tombstone_in_tx(&mut *tx, message_id, now)
            .await?;
        record.content.clear();
        record.recalled_at = Some(now);

        let receivers = self.receivers_for(&mut *tx, &record, None).await?;
        let event = OutboxEvent::new(
            EventType::ChatMessageRecalled,
            Some(record.conversation_id.0),
            receivers,
            &S2CEvent::ChatMessageRecalled(ChatMessageRecalled {
                conversation_id: record.conversation_id,
                message_id: record.message_id,
                sequence: record.sequence,
                recalled_at: now,
            }),
        )
        .map_err(|e| ChatError::Store(format!("compose chat.message.recalled event: {e}")))?;
        self.outbox_repo
            .enqueue_in_tx(&mut *tx, &event)
            .await
            .map_err(|e| ChatError::Store(format!("enqueue chat.message.recalled event: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?;

        Ok(record)
    }

    async fn mark_read(
        &self,
        requester: UserId,
        to: ConversationKey,
        up_to: SequenceNumber,
    ) -> Result<(), ChatError> {
        self.check_access(requester, &to).await?;

        let conversation_id = to.conversation_id(requester);

        let mut tx = self
            .tx_manager
            .begin()
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?;

        self.message_repo
            .upsert_read_marker_in_tx(&mut *tx, conversation_id, requester, up_to)
            .await?;

        tx.commit()
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application_impl::*;

    fn service() -> (Arc<RealConversationService>, MemoryStore) {
        let store = MemoryStore::new();
        let tx_manager: Arc<dyn TxManager> = Arc::new(MemoryTxManager::new());
        let group_repo: Arc<dyn GroupRepo> = Arc::new(MemoryGroupRepo::new(store.clone()));
        let service = RealConversationService::new(
            Arc::new(MemoryMessageRepo::new(store.clone())),
            group_repo.clone(),
            Arc::new(MemoryOutboxRepo::new(store.clone())),
            Arc::new(MembershipAccessPolicy::new(group_repo, tx_manager.clone())),
            tx_manager,
            ChatPolicy {
                edit_window: Duration::minutes(2),
                recall_window: Duration::minutes(2),
                catch_up_limit: 50,
            },
        );
        (Arc::new(service), store)
    }

    fn user() -> UserId {
        UserId(uuid::Uuid::new_v4())
    }

    async fn send(
        service: &RealConversationService,
        from: UserId,
        to: ConversationKey,
        content: &str,
    ) -> MessageRecord {
        service
            .send_message(
                from,
                to,
                MessageId(uuid::Uuid::new_v4()),
                MessageKind::Text,
                content,
                None,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn concurrent_sends_assign_gap_free_sequences() {
        let (service, _store) = service();
        let a = user();
        let b = user();

        let mut handles = Vec::new();
        for i in 0..16u32 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                send(&service, a, ConversationKey::user(b), &format!("m{i}"))
                    .await
                    .sequence
            }));
        }

        let mut sequences = Vec::new();
        for h in handles {
            sequences.push(h.await.unwrap().0);
        }
        sequences.sort_unstable();
        assert_eq!(sequences, (1..=16).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn catch_up_cursor_loop_reconstructs_the_log_exactly_once() {
        let (service, _store) = service();
        let a = user();
        let b = user();
        let key = ConversationKey::user(b);

        for i in 0..25 {
            send(&service, a, key, &format!("m{i}")).await;
        }

        let mut seen = Vec::new();
        let mut cursor = SequenceNumber::ZERO;
        loop {
            let page = service.catch_up(b, ConversationKey::user(a), cursor, Some(10)).await.unwrap();
            if page.messages.is_empty() {
                assert_eq!(page.max_sequence, SequenceNumber(25));
                break;
            }
            for m in &page.messages {
                assert!(m.sequence > cursor);
            }
            cursor = page.messages.last().unwrap().sequence;
            seen.extend(page.messages.into_iter().map(|m| m.message_id));
        }

        assert_eq!(seen.len(), 25);
        let mut dedup = seen.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 25, "no message may arrive twice");
    }

    #[tokio::test]
    async fn offline_recipient_catches_up_from_zero() {
        let (service, _store) = service();
        let a = user();
        let b = user();

        send(&service, a, ConversationKey::user(b), "hi").await;

        let page = service
            .catch_up(b, ConversationKey::user(a), SequenceNumber::ZERO, None)
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].sequence, SequenceNumber(1));
        assert_eq!(page.messages[0].content, "hi");
        assert_eq!(page.max_sequence, SequenceNumber(1));
    }

    #[tokio::test]
    async fn duplicate_send_replays_the_original_without_a_second_event() {
        let (service, store) = service();
        let a = user();
        let b = user();
        let message_id = MessageId(uuid::Uuid::new_v4());

        let first = service
            .send_message(a, ConversationKey::user(b), message_id, MessageKind::Text, "once", None)
            .await
            .unwrap();
        let second = service
            .send_message(a, ConversationKey::user(b), message_id, MessageKind::Text, "once", None)
            .await
            .unwrap();

        assert_eq!(first.sequence, second.sequence);
        assert_eq!(store.outbox_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn edit_inside_the_window_updates_content_and_keeps_the_sequence() {
        let (service, _store) = service();
        let a = user();
        let b = user();
        let sent = send(&service, a, ConversationKey::user(b), "tpyo").await;

        let edited = service
            .edit_message(a, sent.message_id, "typo", Utc::now())
            .await
            .unwrap();
        assert_eq!(edited.content, "typo");
        assert_eq!(edited.sequence, sent.sequence);
        assert!(edited.edited_at.is_some());
    }

    #[tokio::test]
    async fn edit_and_recall_events_include_the_actor_as_a_receiver() {
        let (service, store) = service();
        let a = user();
        let b = user();
        let sent = send(&service, a, ConversationKey::user(b), "draft").await;
        let recalled = send(&service, a, ConversationKey::user(b), "oops").await;

        service
            .edit_message(a, sent.message_id, "final", Utc::now())
            .await
            .unwrap();
        service
            .recall_message(a, recalled.message_id, Utc::now())
            .await
            .unwrap();

        let receivers_of = |event_type: EventType| -> Vec<UserId> {
            let event = store
                .outbox_snapshot()
                .into_iter()
                .find(|e| e.event_type == event_type)
                .unwrap();
            serde_json::from_value(event.receivers_json).unwrap()
        };

        // the sender's ack covers the sending device and catch-up covers
        // its siblings, so new-message events exclude the sender
        let new = receivers_of(EventType::ChatMessageNew);
        assert!(!new.contains(&a));
        assert!(new.contains(&b));

        // edits and recalls are invisible to catch-up once a device has
        // passed the sequence, so the actor's other devices must be pushed
        for event_type in [EventType::ChatMessageEdited, EventType::ChatMessageRecalled] {
            let receivers = receivers_of(event_type);
            assert!(receivers.contains(&a));
            assert!(receivers.contains(&b));
        }
    }

    #[tokio::test]
    async fn edit_after_the_window_fails_with_window_expired() {
        let (service, store) = service();
        let a = user();
        let b = user();
        let sent = send(&service, a, ConversationKey::user(b), "old").await;
        store.backdate(sent.message_id, Utc::now() - Duration::minutes(10));

        let result = service
            .edit_message(a, sent.message_id, "too late", Utc::now())
            .await;
        assert!(matches!(result, Err(ChatError::WindowExpired)));
    }

    #[tokio::test]
    async fn edit_by_a_non_sender_fails_with_not_author() {
        let (service, _store) = service();
        let a = user();
        let b = user();
        let sent = send(&service, a, ConversationKey::user(b), "mine").await;

        let result = service
            .edit_message(b, sent.message_id, "theirs", Utc::now())
            .await;
        assert!(matches!(result, Err(ChatError::NotAuthor)));
    }

    #[tokio::test]
    async fn recall_tombstones_but_keeps_id_and_sequence() {
        let (service, _store) = service();
        let a = user();
        let b = user();
        let sent = send(&service, a, ConversationKey::user(b), "regret").await;

        let recalled = service
            .recall_message(a, sent.message_id, Utc::now())
            .await
            .unwrap();
        assert!(recalled.content.is_empty());
        assert!(recalled.is_recalled());
        assert_eq!(recalled.sequence, sent.sequence);

        // catch-up still sees the slot, as a marker rather than a hole
        let page = service
            .catch_up(b, ConversationKey::user(a), SequenceNumber::ZERO, None)
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert!(page.messages[0].is_recalled());
    }

    #[tokio::test]
    async fn mark_read_only_moves_forward() {
        let (service, store) = service();
        let a = user();
        let b = user();
        let key = ConversationKey::user(b);
        for i in 0..5 {
            send(&service, a, key, &format!("m{i}")).await;
        }

        service.mark_read(a, key, SequenceNumber(5)).await.unwrap();
        // marking an earlier point again has no effect
        service.mark_read(a, key, SequenceNumber(3)).await.unwrap();

        let repo = MemoryMessageRepo::new(store);
        let tx_manager = MemoryTxManager::new();
        let mut tx = tx_manager.begin().await.unwrap();
        let marker = repo
            .read_marker_in_tx(&mut *tx, key.conversation_id(a), a)
            .await
            .unwrap();
        assert_eq!(marker, SequenceNumber(5));
    }

    #[tokio::test]
    async fn group_send_fans_out_to_members_except_the_sender() {
        let (service, store) = service();
        let (a, b, c) = (user(), user(), user());
        let group = GroupId(uuid::Uuid::new_v4());
        store.set_group(group, vec![a, b, c]);

        send(&service, a, ConversationKey::group(group), "all hands").await;

        let events = store.outbox_snapshot();
        assert_eq!(events.len(), 1);
        let receivers: Vec<UserId> =
            serde_json::from_value(events[0].receivers_json.clone()).unwrap();
        assert_eq!(receivers.len(), 2);
        assert!(receivers.contains(&b) && receivers.contains(&c));
        assert!(!receivers.contains(&a));
    }

    #[tokio::test]
    async fn non_member_cannot_touch_a_group_conversation() {
        let (service, store) = service();
        let (member, outsider) = (user(), user());
        let group = GroupId(uuid::Uuid::new_v4());
        store.set_group(group, vec![member]);

        let result = service
            .send_message(
                outsider,
                ConversationKey::group(group),
                MessageId(uuid::Uuid::new_v4()),
                MessageKind::Text,
                "let me in",
                None,
            )
            .await;
        assert!(matches!(result, Err(ChatError::NotMember)));
    }
}
