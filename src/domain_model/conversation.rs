use crate::domain_model::*;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct GroupId(pub uuid::Uuid);

#[derive(
    Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct ConversationId(pub uuid::Uuid);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    User,
    Group,
}

/// How a client addresses a conversation: the recipient. Sequence numbers
/// are scoped per conversation, so both sides of a direct chat must resolve
/// to the same log.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub kind: PeerKind,
    pub peer_id: uuid::Uuid,
}

/// Namespace for deriving direct-conversation ids from a user pair.
const DIRECT_CONVERSATION_NS: uuid::Uuid = uuid::uuid!("f2f9a2c4-9a14-4bcb-9e75-6f07d5a2a3b1");

impl ConversationKey {
    pub fn user(peer: UserId) -> Self {
        Self {
            kind: PeerKind::User,
            peer_id: peer.0,
        }
    }

    pub fn group(group: GroupId) -> Self {
        Self {
            kind: PeerKind::Group,
            peer_id: group.0,
        }
    }

    /// Canonical log id for this key as seen by `me`.
    ///
    /// A group conversation is its group id. A direct conversation is a v5
    /// uuid over the sorted user pair, so (A addressing B) and (B addressing
    /// A) land on the same sequence scope.
    pub fn conversation_id(&self, me: UserId) -> ConversationId {
        match self.kind {
            PeerKind::Group => ConversationId(self.peer_id),
            PeerKind::User => {
                let pair = UserPair::new(me, UserId(self.peer_id));
                let mut name = [0u8; 32];
                name[..16].copy_from_slice(pair.min().0.as_bytes());
                name[16..].copy_from_slice(pair.max().0.as_bytes());
                ConversationId(uuid::Uuid::new_v5(&DIRECT_CONVERSATION_NS, &name))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_conversation_id_is_symmetric() {
        let a = UserId(uuid::Uuid::new_v4());
        let b = UserId(uuid::Uuid::new_v4());
        let from_a = ConversationKey::user(b).conversation_id(a);
        let from_b = ConversationKey::user(a).conversation_id(b);
        assert_eq!(from_a, from_b);
    }

    #[test]
    fn group_conversation_id_is_the_group_id() {
        let g = GroupId(uuid::Uuid::new_v4());
        let me = UserId(uuid::Uuid::new_v4());
        assert_eq!(ConversationKey::group(g).conversation_id(me).0, g.0);
    }
}
