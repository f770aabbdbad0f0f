use crate::domain_model::*;
use crate::server::{DeliveryRouter, EventHandler, HandleOutcome, Recipient};
use std::sync::Arc;

/// Unwraps bus envelopes and pushes the body to each receiver's devices.
/// A receiver that cannot be reached is logged and skipped; the envelope
/// still commits, because catch-up covers the gap.
pub struct ConnFanoutHandler {
    router: Arc<dyn DeliveryRouter>,
}

impl ConnFanoutHandler {
    pub fn new(router: Arc<dyn DeliveryRouter>) -> Self {
        Self { router }
    }
}

#[async_trait::async_trait]
impl EventHandler for ConnFanoutHandler {
    async fn handle(&self, payload: &[u8]) -> anyhow::Result<HandleOutcome> {
        let envelope = serde_json::from_slice::<S2CEnvelope>(payload)?;

        for receiver in envelope.receivers {
            if let Err(e) = self
                .router
                .deliver(Recipient::User(receiver), &envelope.body)
                .await
            {
                tracing::warn!("fan-out to [{}] dropped: {e}", receiver);
            }
        }

        Ok(HandleOutcome::Commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingRouter {
        delivered: Mutex<Vec<UserId>>,
    }

    #[async_trait::async_trait]
    impl DeliveryRouter for CountingRouter {
        async fn deliver(&self, recipient: Recipient, _event: &S2CEvent) -> anyhow::Result<()> {
            if let Recipient::User(user) = recipient {
                self.delivered.lock().unwrap().push(user);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn every_receiver_in_the_envelope_is_pushed() {
        let router = Arc::new(CountingRouter::default());
        let handler = ConnFanoutHandler::new(router.clone());

        let (a, b) = (
            UserId(uuid::Uuid::new_v4()),
            UserId(uuid::Uuid::new_v4()),
        );
        let envelope = S2CEnvelope {
            receivers: vec![a, b],
            body: S2CEvent::PresenceChanged(PresenceUpdate {
                user_id: a,
                online: true,
                last_seen: None,
            }),
        };
        let payload = serde_json::to_vec(&envelope).unwrap();

        let outcome = handler.handle(&payload).await.unwrap();
        assert!(matches!(outcome, HandleOutcome::Commit));
        assert_eq!(*router.delivered.lock().unwrap(), vec![a, b]);
    }

    #[tokio::test]
    async fn a_malformed_envelope_is_an_error() {
        let handler = ConnFanoutHandler::new(Arc::new(CountingRouter::default()));
        assert!(handler.handle(b"not json").await.is_err());
    }
}
