use crate::domain_model::*;
use crate::domain_port::*;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

pub struct RedisPresenceStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisPresenceStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        RedisPresenceStore {
            conn,
            prefix: prefix.into(),
        }
    }

    fn key(&self, user: UserId) -> String {
        format!("{}:last_seen:{}", self.prefix, user)
    }
}

#[async_trait::async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn save_last_seen(&self, user: UserId, at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.key(user), at.to_rfc3339()).await?;
        Ok(())
    }

    async fn last_seen(&self, user: UserId) -> anyhow::Result<Option<DateTime<Utc>>> {
        let mut conn = self.conn.clone();
        let val: Option<String> = conn.get(self.key(user)).await?;
        match val {
            None => Ok(None),
            Some(s) => {
                let at = DateTime::parse_from_rfc3339(&s)?.with_timezone(&Utc);
                Ok(Some(at))
            }
        }
    }
}
