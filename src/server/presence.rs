use crate::domain_model::*;
use crate::domain_port::PresenceStore;
use crate::server::registry::RegistryEvent;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

/// Derives per-user presence from registry churn. A user is online while
/// any device is connected; only the 0→1 and 1→0 transitions are
/// announced, so a second device connecting is silent.
pub struct PresenceTracker {
    counts: DashMap<UserId, u32>,
    store: Arc<dyn PresenceStore>,
    updates: broadcast::Sender<PresenceUpdate>,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            counts: DashMap::new(),
            store,
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.updates.subscribe()
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.counts.get(&user).map(|c| *c > 0).unwrap_or(false)
    }

    pub async fn run(
        self: Arc<Self>,
        mut events: UnboundedReceiver<RegistryEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                e = events.recv() => match e {
                    Some(e) => e,
                    None => break,
                },
            };
            self.apply(event).await;
        }
        tracing::info!("PresenceTracker shutting down");
    }

    async fn apply(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Connected { user_id, .. } => {
                let mut count = self.counts.entry(user_id).or_insert(0);
                *count += 1;
                if *count == 1 {
                    drop(count);
                    self.announce(PresenceUpdate {
                        user_id,
                        online: true,
                        last_seen: None,
                    });
                }
            }
            RegistryEvent::Disconnected { user_id, at, .. } => {
                let went_offline = match self.counts.get_mut(&user_id) {
                    Some(mut count) => {
                        *count = count.saturating_sub(1);
                        *count == 0
                    }
                    None => false,
                };
                if went_offline {
                    self.counts.remove(&user_id);
                    if let Err(e) = self.store.save_last_seen(user_id, at).await {
                        tracing::error!("failed to persist last_seen for [{}]: {e}", user_id);
                    }
                    self.announce(PresenceUpdate {
                        user_id,
                        online: false,
                        last_seen: Some(at),
                    });
                }
            }
        }
    }

    fn announce(&self, update: PresenceUpdate) {
        tracing::debug!(
            "presence: [{}] online={} ",
            update.user_id,
            update.online
        );
        // no subscribers is fine, e.g. before the fan-out loop starts
        let _ = self.updates.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    struct FakePresenceStore {
        saved: Mutex<Vec<(UserId, DateTime<Utc>)>>,
    }

    #[async_trait::async_trait]
    impl PresenceStore for FakePresenceStore {
        async fn save_last_seen(&self, user: UserId, at: DateTime<Utc>) -> anyhow::Result<()> {
            self.saved.lock().unwrap().push((user, at));
            Ok(())
        }

        async fn last_seen(&self, user: UserId) -> anyhow::Result<Option<DateTime<Utc>>> {
            Ok(self
                .saved
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(u, _)| *u == user)
                .map(|(_, at)| *at))
        }
    }

    fn tracker() -> (Arc<PresenceTracker>, Arc<FakePresenceStore>) {
        let store = Arc::new(FakePresenceStore {
            saved: Mutex::new(Vec::new()),
        });
        (Arc::new(PresenceTracker::new(store.clone())), store)
    }

    #[tokio::test]
    async fn only_the_first_device_announces_online() {
        let (tracker, _) = tracker();
        let mut updates = tracker.subscribe();
        let user = UserId(uuid::Uuid::new_v4());
        let conn = || ConnectionId::random();

        tracker
            .apply(RegistryEvent::Connected {
                user_id: user,
                connection_id: conn(),
            })
            .await;
        tracker
            .apply(RegistryEvent::Connected {
                user_id: user,
                connection_id: conn(),
            })
            .await;

        let update = updates.try_recv().unwrap();
        assert!(update.online);
        assert_eq!(update.user_id, user);
        // second device is silent
        assert!(updates.try_recv().is_err());
        assert!(tracker.is_online(user));
    }

    #[tokio::test]
    async fn offline_is_announced_once_all_devices_are_gone() {
        let (tracker, store) = tracker();
        let user = UserId(uuid::Uuid::new_v4());
        let first = ConnectionId::random();
        let second = ConnectionId::random();

        tracker
            .apply(RegistryEvent::Connected {
                user_id: user,
                connection_id: first,
            })
            .await;
        tracker
            .apply(RegistryEvent::Connected {
                user_id: user,
                connection_id: second,
            })
            .await;

        let mut updates = tracker.subscribe();
        let gone_at = Utc::now();
        tracker
            .apply(RegistryEvent::Disconnected {
                user_id: user,
                connection_id: first,
                at: gone_at,
            })
            .await;
        assert!(updates.try_recv().is_err());
        assert!(tracker.is_online(user));

        tracker
            .apply(RegistryEvent::Disconnected {
                user_id: user,
                connection_id: second,
                at: gone_at,
            })
            .await;
        let update = updates.try_recv().unwrap();
        assert!(!update.online);
        assert_eq!(update.last_seen, Some(gone_at));
        assert!(!tracker.is_online(user));

        assert_eq!(store.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_loop_consumes_registry_events() {
        let (tracker, _) = tracker();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(tracker.clone().run(rx, cancel.clone()));

        let user = UserId(uuid::Uuid::new_v4());
        tx.send(RegistryEvent::Connected {
            user_id: user,
            connection_id: ConnectionId::random(),
        })
        .unwrap();

        for _ in 0..50 {
            if tracker.is_online(user) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(tracker.is_online(user));

        cancel.cancel();
        handle.await.unwrap();
    }
}
