use super::util::downcast;
use crate::domain_model::*;
use crate::domain_port::*;
use sqlx::{MySqlPool, Row};

pub struct MySqlGroupRepo {
    pool: MySqlPool,
}

impl MySqlGroupRepo {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl GroupRepo for MySqlGroupRepo {
    async fn membership_exists_in_tx<'t>(
        &self,
        tx: &mut dyn StorageTx<'t>,
        group: GroupId,
        user: UserId,
    ) -> anyhow::Result<bool> {
        let tx = downcast(tx);

        let row = sqlx::query(
            "SELECT 1 AS present FROM group_member WHERE group_id = ? AND user_id = ?",
        )
        .bind(group)
        .bind(user)
        .fetch_optional(tx.conn())
        .await?;

        Ok(row.is_some())
    }

    async fn list_member_ids_in_tx<'t>(
        &self,
        tx: &mut dyn StorageTx<'t>,
        group: GroupId,
    ) -> anyhow::Result<Vec<UserId>> {
        let tx = downcast(tx);

        let rows = sqlx::query("SELECT user_id FROM group_member WHERE group_id = ?")
            .bind(group)
            .fetch_all(tx.conn())
            .await?;

        Ok(rows.iter().map(|r| r.get::<UserId, _>("user_id")).collect())
    }

    async fn list_member_ids(&self, group: GroupId) -> anyhow::Result<Vec<UserId>> {
        let rows = sqlx::query("SELECT user_id FROM group_member WHERE group_id = ?")
            .bind(group)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(|r| r.get::<UserId, _>("user_id")).collect())
    }
}
