use crate::server::{EventConsumer, EventHandler, HandleOutcome};
use futures_util::StreamExt;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Manually-committed consumer: an envelope's offset is committed only
/// after the fan-out handler accepted it, so a crash between poll and
/// fan-out replays instead of dropping.
pub struct KafkaConsumer {
    bootstrap_server: String,
    client_id: String,
    cancellation_token: CancellationToken,
}

impl KafkaConsumer {
    pub fn new(
        bootstrap_server: &str,
        client_id: &str,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            bootstrap_server: bootstrap_server.to_string(),
            client_id: client_id.to_string(),
            cancellation_token,
        }
    }

    fn stream_consumer(&self, consumer_group_id: &str) -> anyhow::Result<StreamConsumer> {
        let consumer = ClientConfig::new()
            .set("bootstrap.servers", &self.bootstrap_server)
            .set("client.id", &self.client_id)
            .set("group.id", consumer_group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        Ok(consumer)
    }

    /// Delivery topics are per-process and ephemeral, so they are created
    /// on the fly with a single unreplicated partition; durability lives
    /// in the message store, not the bus.
    async fn ensure_topics(&self, topics: &[&str]) -> anyhow::Result<()> {
        let admin: AdminClient<_> = ClientConfig::new()
            .set("bootstrap.servers", &self.bootstrap_server)
            .create()?;

        let wanted: Vec<_> = topics
            .iter()
            .map(|t| NewTopic::new(t, 1, TopicReplication::Fixed(1)))
            .collect();
        let _ = admin.create_topics(&wanted, &AdminOptions::new()).await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl EventConsumer for KafkaConsumer {
    async fn run(
        &self,
        consumer_group_id: &str,
        topics: &[&str],
        handler: Arc<dyn EventHandler>,
    ) -> anyhow::Result<()> {
        let consumer = self.stream_consumer(consumer_group_id)?;
        self.ensure_topics(topics).await?;
        consumer.subscribe(topics)?;

        let mut stream = consumer.stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    tracing::info!("Kafka consumer shutting down...");
                    break;
                }
                msg = stream.next() => msg,
            };

            let record = match next {
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    // broker hiccup
                    tracing::warn!(error = ?e, "consumer poll error");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
                None => {
                    tracing::error!("Kafka consumer stream terminated");
                    break;
                }
            };

            match handler.handle(record.payload().unwrap_or(&[])).await {
                Ok(HandleOutcome::Commit | HandleOutcome::SkipCommit) => {
                    if let Err(e) = consumer.commit_message(&record, CommitMode::Async) {
                        tracing::warn!(error = ?e, "commit failed but ignored");
                    }
                }
                Ok(HandleOutcome::Retry) => {
                    // retried on the next poll; pace the loop so a poison
                    // message cannot spin it
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => {
                    tracing::error!(error = ?e, "handler error; retrying");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        consumer.unsubscribe();

        Ok(())
    }
}
