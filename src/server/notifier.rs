use crate::domain_port::*;
use crate::server::EventPublisher;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry schedule for the outbox dispatcher. An entry that keeps failing
/// is retried with exponential backoff until `max_attempts`, then
/// dead-lettered.
pub struct OutboxPolicy {
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub max_attempts: u32,
    pub backoff_base: chrono::Duration,
    pub backoff_cap: chrono::Duration,
}

impl OutboxPolicy {
    /// Delay before the next attempt, given how many have already failed.
    pub fn backoff_after(&self, failed_attempts: u32) -> chrono::Duration {
        let exp = failed_attempts.min(16);
        let base_ms = self.backoff_base.num_milliseconds();
        let delay_ms = base_ms.saturating_mul(1i64 << exp);
        chrono::Duration::milliseconds(delay_ms.min(self.backoff_cap.num_milliseconds()))
    }
}

/// Drains the transactional outbox onto the event bus. Claim, publish and
/// bookkeeping all happen inside one storage transaction, so a crashed
/// dispatcher releases its claims and another instance picks them up.
pub struct Notifier {
    tx_manager: Arc<dyn TxManager>,
    outbox_repo: Arc<dyn OutboxRepo>,
    event_publisher: Arc<dyn EventPublisher>,
    topic: String,
    policy: OutboxPolicy,
    cancellation_token: CancellationToken,
}

impl Notifier {
    pub fn new(
        tx_manager: Arc<dyn TxManager>,
        outbox_repo: Arc<dyn OutboxRepo>,
        event_publisher: Arc<dyn EventPublisher>,
        topic: &str,
        policy: OutboxPolicy,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            tx_manager,
            outbox_repo,
            event_publisher,
            topic: topic.to_owned(),
            policy,
            cancellation_token,
        }
    }

    fn build_envelope(
        receivers_json: &serde_json::Value,
        payload_json: &serde_json::Value,
    ) -> anyhow::Result<Vec<u8>> {
        let envelope = json!({
            "receivers": receivers_json,
            "body": payload_json,
        });

        Ok(serde_json::to_vec(&envelope)?)
    }

    async fn tick_once(&self) -> anyhow::Result<()> {
        let mut tx = self.tx_manager.begin().await?;

        let now = Utc::now();
        let batch = self
            .outbox_repo
            .claim_ready_batch_in_tx(&mut *tx, now, self.policy.batch_size)
            .await?;

        if batch.is_empty() {
            tx.commit().await?;
            tokio::time::sleep(self.policy.poll_interval).await;
            return Ok(());
        }

        for event in &batch {
            let key = match event.partition_key {
                Some(key) => key,
                None => event.event_id.0,
            };
            let payload = Self::build_envelope(&event.receivers_json, &event.payload_json)?;

            match self
                .event_publisher
                .publish(&self.topic, key.to_string().as_bytes(), &payload)
                .await
            {
                Ok(()) => {
                    self.outbox_repo
                        .mark_published_in_tx(&mut *tx, event.event_id, Utc::now())
                        .await?;
                }
                Err(e) => {
                    let failed_attempts = event.attempt_count + 1;
                    if failed_attempts >= self.policy.max_attempts {
                        tracing::error!(
                            "outbox entry {} dead-lettered after {} attempts: {e:#}",
                            event.event_id.0,
                            failed_attempts
                        );
                        self.outbox_repo
                            .mark_failed_in_tx(&mut *tx, event.event_id, Utc::now(), &format!("{e:#}"))
                            .await?;
                    } else {
                        let next = Utc::now() + self.policy.backoff_after(failed_attempts);
                        self.outbox_repo
                            .reschedule_in_tx(&mut *tx, event.event_id, next, &format!("{e:#}"))
                            .await?;
                    }
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    tracing::info!("Notifier shutting down...");
                    break;
                }
                result = self.tick_once() => {
                    if let Err(e) = result {
                        tracing::error!("Notifier error: {:#?}", e);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application_impl::*;
    use crate::domain_model::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyPublisher {
        fail_first: AtomicU32,
        published: Mutex<Vec<Vec<u8>>>,
    }

    impl FlakyPublisher {
        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_first: AtomicU32::new(times),
                published: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl EventPublisher for FlakyPublisher {
        async fn publish(&self, _topic: &str, _key: &[u8], payload: &[u8]) -> anyhow::Result<()> {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("broker unavailable");
            }
            self.published.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    fn policy(max_attempts: u32) -> OutboxPolicy {
        OutboxPolicy {
            poll_interval: Duration::from_millis(1),
            batch_size: 16,
            max_attempts,
            backoff_base: chrono::Duration::zero(),
            backoff_cap: chrono::Duration::zero(),
        }
    }

    async fn enqueue_one(store: &MemoryStore, tx_manager: &Arc<MemoryTxManager>) {
        let repo = MemoryOutboxRepo::new(store.clone());
        let event = OutboxEvent::new(
            EventType::ChatMessageNew,
            None,
            vec![UserId(uuid::Uuid::new_v4())],
            &serde_json::json!({"content": "hi"}),
        )
        .unwrap();
        let mut tx = tx_manager.begin().await.unwrap();
        repo.enqueue_in_tx(&mut *tx, &event).await.unwrap();
        tx.commit().await.unwrap();
    }

    fn notifier(
        store: &MemoryStore,
        tx_manager: Arc<MemoryTxManager>,
        publisher: Arc<FlakyPublisher>,
        max_attempts: u32,
    ) -> Notifier {
        Notifier::new(
            tx_manager,
            Arc::new(MemoryOutboxRepo::new(store.clone())),
            publisher,
            "chat.event.test",
            policy(max_attempts),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn a_claimed_entry_is_published_and_marked() {
        let store = MemoryStore::new();
        let tx_manager = Arc::new(MemoryTxManager::new());
        enqueue_one(&store, &tx_manager).await;

        let publisher = FlakyPublisher::failing(0);
        let n = notifier(&store, tx_manager, publisher.clone(), 3);
        n.tick_once().await.unwrap();

        assert_eq!(store.published_count(), 1);
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
        // the envelope carries receivers alongside the body
        let payload: serde_json::Value =
            serde_json::from_slice(&publisher.published.lock().unwrap()[0]).unwrap();
        assert!(payload.get("receivers").is_some());
        assert!(payload.get("body").is_some());
    }

    #[tokio::test]
    async fn a_transient_failure_is_retried_until_it_succeeds() {
        let store = MemoryStore::new();
        let tx_manager = Arc::new(MemoryTxManager::new());
        enqueue_one(&store, &tx_manager).await;

        let publisher = FlakyPublisher::failing(2);
        let n = notifier(&store, tx_manager, publisher.clone(), 5);
        for _ in 0..3 {
            n.tick_once().await.unwrap();
        }

        assert_eq!(store.published_count(), 1);
        assert_eq!(store.failed_count(), 0);
    }

    #[tokio::test]
    async fn exhausted_attempts_dead_letter_the_entry() {
        let store = MemoryStore::new();
        let tx_manager = Arc::new(MemoryTxManager::new());
        enqueue_one(&store, &tx_manager).await;

        let publisher = FlakyPublisher::failing(u32::MAX);
        let n = notifier(&store, tx_manager, publisher.clone(), 2);
        for _ in 0..4 {
            n.tick_once().await.unwrap();
        }

        assert_eq!(store.published_count(), 0);
        assert_eq!(store.failed_count(), 1);
        // a dead-lettered entry is never claimed again
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = OutboxPolicy {
            poll_interval: Duration::from_millis(200),
            batch_size: 256,
            max_attempts: 10,
            backoff_base: chrono::Duration::milliseconds(500),
            backoff_cap: chrono::Duration::seconds(60),
        };
        assert_eq!(p.backoff_after(0).num_milliseconds(), 500);
        assert_eq!(p.backoff_after(1).num_milliseconds(), 1_000);
        assert_eq!(p.backoff_after(4).num_milliseconds(), 8_000);
        assert_eq!(p.backoff_after(12).num_milliseconds(), 60_000);
        assert_eq!(p.backoff_after(u32::MAX).num_milliseconds(), 60_000);
    }
}
