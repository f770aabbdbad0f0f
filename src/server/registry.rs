use crate::domain_model::*;
use crate::server::ConnMessage;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc::{Sender, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything the hub needs to reach and tear down one live connection.
pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub connected_at: DateTime<Utc>,
    pub control: Sender<ConnMessage>,
    pub mailbox: Sender<ConnMessage>,
    pub actor_handle: Mutex<Option<JoinHandle<()>>>,
    pub cancellation_token: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
pub enum RegistryEvent {
    Connected {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    Disconnected {
        user_id: UserId,
        connection_id: ConnectionId,
        at: DateTime<Utc>,
    },
}

#[derive(Default)]
struct TwoWayIndex {
    forward: HashMap<UserId, HashMap<ConnectionId, Arc<ConnectionRecord>>>,
    reverse: HashMap<ConnectionId, UserId>,
}

/// User ⇄ connection index. Both directions live under one lock, so a
/// reader can never observe a connection present in one map and absent
/// from the other. An explicitly-owned instance injected where needed,
/// not process-global state.
pub struct ConnectionRegistry {
    index: RwLock<TwoWayIndex>,
    events: UnboundedSender<RegistryEvent>,
}

impl ConnectionRegistry {
    pub fn new(events: UnboundedSender<RegistryEvent>) -> Self {
        Self {
            index: RwLock::new(TwoWayIndex::default()),
            events,
        }
    }

    pub fn add(&self, record: Arc<ConnectionRecord>) {
        let user_id = record.user_id;
        let connection_id = record.connection_id;
        {
            let mut index = self.index.write().expect("registry lock poisoned");
            index
                .forward
                .entry(user_id)
                .or_default()
                .insert(connection_id, record);
            index.reverse.insert(connection_id, user_id);
        }
        // presence tracker is the only listener; it may already be gone
        // during shutdown
        let _ = self.events.send(RegistryEvent::Connected {
            user_id,
            connection_id,
        });
    }

    pub fn remove(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionRecord>> {
        let removed = {
            let mut index = self.index.write().expect("registry lock poisoned");
            let user_id = index.reverse.remove(&connection_id)?;
            let record = match index.forward.get_mut(&user_id) {
                Some(connections) => {
                    let record = connections.remove(&connection_id);
                    if connections.is_empty() {
                        index.forward.remove(&user_id);
                    }
                    record
                }
                None => None,
            };
            record.map(|r| (user_id, r))
        };

        let (user_id, record) = removed?;
        let _ = self.events.send(RegistryEvent::Disconnected {
            user_id,
            connection_id,
            at: Utc::now(),
        });
        Some(record)
    }

    pub fn connections_of(&self, user_id: UserId) -> Vec<Arc<ConnectionRecord>> {
        let index = self.index.read().expect("registry lock poisoned");
        index
            .forward
            .get(&user_id)
            .map(|connections| connections.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn user_of(&self, connection_id: ConnectionId) -> Option<UserId> {
        let index = self.index.read().expect("registry lock poisoned");
        index.reverse.get(&connection_id).copied()
    }

    pub fn connection_count(&self, user_id: UserId) -> usize {
        let index = self.index.read().expect("registry lock poisoned");
        index.forward.get(&user_id).map(|c| c.len()).unwrap_or(0)
    }

    pub fn all(&self) -> Vec<Arc<ConnectionRecord>> {
        let index = self.index.read().expect("registry lock poisoned");
        index
            .forward
            .values()
            .flat_map(|connections| connections.values().cloned())
            .collect()
    }
}
