use crate::domain_model::*;
use crate::domain_port::GroupRepo;
use crate::server::registry::ConnectionRegistry;
use crate::server::{ConnMessage, DeliveryRouter, Recipient};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;

/// Pushes events to whatever devices are currently connected. Offline
/// recipients and full mailboxes are dropped here; the message store's
/// catch-up path is the durable fallback.
pub struct ConnectionRouter {
    registry: Arc<ConnectionRegistry>,
    group_repo: Arc<dyn GroupRepo>,
}

impl ConnectionRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, group_repo: Arc<dyn GroupRepo>) -> Self {
        Self {
            registry,
            group_repo,
        }
    }

    fn push_user(&self, user: UserId, payload: &str) {
        let connections = self.registry.connections_of(user);
        if connections.is_empty() {
            tracing::trace!("user [{}] offline, left for catch-up", user);
            return;
        }
        for record in connections {
            match record
                .mailbox
                .try_send(ConnMessage::Text(payload.to_owned()))
            {
                Ok(_) => {}
                Err(TrySendError::Full(..)) => {
                    tracing::warn!(
                        "mailbox full for [{}/{}], dropping push",
                        user,
                        record.connection_id
                    );
                }
                Err(TrySendError::Closed(..)) => {
                    tracing::debug!(
                        "mailbox closed for [{}/{}], actor is going away",
                        user,
                        record.connection_id
                    );
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl DeliveryRouter for ConnectionRouter {
    async fn deliver(&self, recipient: Recipient, event: &S2CEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        match recipient {
            Recipient::User(user) => self.push_user(user, &payload),
            Recipient::Group(group) => {
                for member in self.group_repo.list_member_ids(group).await? {
                    self.push_user(member, &payload);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application_impl::{MemoryGroupRepo, MemoryStore};
    use crate::server::registry::ConnectionRecord;
    use chrono::Utc;
    use std::sync::Mutex;
    use tokio::sync::mpsc::Receiver;
    use tokio_util::sync::CancellationToken;

    fn connect(
        registry: &ConnectionRegistry,
        user: UserId,
    ) -> (ConnectionId, Receiver<ConnMessage>) {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let id = ConnectionId::random();
        registry.add(Arc::new(ConnectionRecord {
            connection_id: id,
            user_id: user,
            connected_at: Utc::now(),
            control: tx.clone(),
            mailbox: tx,
            actor_handle: Mutex::new(None),
            cancellation_token: CancellationToken::new(),
        }));
        (id, rx)
    }

    fn presence_event(user: UserId) -> S2CEvent {
        S2CEvent::PresenceChanged(PresenceUpdate {
            user_id: user,
            online: true,
            last_seen: None,
        })
    }

    #[tokio::test]
    async fn every_device_of_a_user_gets_the_push() {
        let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry::new(events_tx));
        let router = ConnectionRouter::new(
            registry.clone(),
            Arc::new(MemoryGroupRepo::new(MemoryStore::new())),
        );

        let user = UserId(uuid::Uuid::new_v4());
        let (_, mut phone) = connect(&registry, user);
        let (_, mut laptop) = connect(&registry, user);

        router
            .deliver(Recipient::User(user), &presence_event(user))
            .await
            .unwrap();

        assert!(matches!(phone.recv().await.unwrap(), ConnMessage::Text(_)));
        assert!(matches!(laptop.recv().await.unwrap(), ConnMessage::Text(_)));
    }

    #[tokio::test]
    async fn delivering_to_an_offline_user_is_not_an_error() {
        let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry::new(events_tx));
        let router = ConnectionRouter::new(
            registry,
            Arc::new(MemoryGroupRepo::new(MemoryStore::new())),
        );

        let user = UserId(uuid::Uuid::new_v4());
        router
            .deliver(Recipient::User(user), &presence_event(user))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn group_delivery_reaches_each_connected_member() {
        let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry::new(events_tx));
        let store = MemoryStore::new();
        let router = ConnectionRouter::new(
            registry.clone(),
            Arc::new(MemoryGroupRepo::new(store.clone())),
        );

        let a = UserId(uuid::Uuid::new_v4());
        let b = UserId(uuid::Uuid::new_v4());
        let offline = UserId(uuid::Uuid::new_v4());
        let group = GroupId(uuid::Uuid::new_v4());
        store.set_group(group, vec![a, b, offline]);

        let (_, mut a_rx) = connect(&registry, a);
        let (_, mut b_rx) = connect(&registry, b);

        router
            .deliver(Recipient::Group(group), &presence_event(a))
            .await
            .unwrap();

        assert!(matches!(a_rx.recv().await.unwrap(), ConnMessage::Text(_)));
        assert!(matches!(b_rx.recv().await.unwrap(), ConnMessage::Text(_)));
    }
}
