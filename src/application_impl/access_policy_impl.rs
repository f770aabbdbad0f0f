use crate::domain_model::*;
use crate::domain_port::*;
use std::sync::Arc;

/// Capability check backed by group membership. Direct conversations are
/// open to their two parties by construction; policy beyond that
/// (friendship requirements, blocks) belongs to the collaborator that
/// replaces this implementation.
pub struct MembershipAccessPolicy {
    group_repo: Arc<dyn GroupRepo>,
    tx_manager: Arc<dyn TxManager>,
}

impl MembershipAccessPolicy {
    pub fn new(group_repo: Arc<dyn GroupRepo>, tx_manager: Arc<dyn TxManager>) -> Self {
        Self {
            group_repo,
            tx_manager,
        }
    }
}

#[async_trait::async_trait]
impl AccessPolicy for MembershipAccessPolicy {
    async fn can_access(
        &self,
        user: UserId,
        conversation: &ConversationKey,
    ) -> anyhow::Result<bool> {
        match conversation.kind {
            PeerKind::User => Ok(true),
            PeerKind::Group => {
                let mut tx = self.tx_manager.begin().await?;
                let is_member = self
                    .group_repo
                    .membership_exists_in_tx(&mut *tx, GroupId(conversation.peer_id), user)
                    .await?;
                tx.commit().await?;
                Ok(is_member)
            }
        }
    }
}
