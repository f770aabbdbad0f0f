use crate::domain_model::*;

/// Authorization collaborator. The core treats the answer as opaque; policy
/// (friendship rules, blocks, bans) lives behind this boundary.
#[async_trait::async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn can_access(&self, user: UserId, conversation: &ConversationKey)
    -> anyhow::Result<bool>;
}
