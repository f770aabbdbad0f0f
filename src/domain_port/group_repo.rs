use crate::domain_model::*;
use crate::domain_port::repo_tx::StorageTx;

/// Group membership, consumed as an external collaborator: the delivery
/// core reads members for fan-out and the capability check but does not
/// manage group lifecycle.
#[async_trait::async_trait]
pub trait GroupRepo: Send + Sync {
    async fn membership_exists_in_tx<'t>(
        &self,
        tx: &mut dyn StorageTx<'t>,
        group: GroupId,
        user: UserId,
    ) -> anyhow::Result<bool>;

    async fn list_member_ids_in_tx<'t>(
        &self,
        tx: &mut dyn StorageTx<'t>,
        group: GroupId,
    ) -> anyhow::Result<Vec<UserId>>;

    /// Non-transactional variant for the delivery router's fan-out path,
    /// which must not hold a storage transaction while pushing.
    async fn list_member_ids(&self, group: GroupId) -> anyhow::Result<Vec<UserId>>;
}
