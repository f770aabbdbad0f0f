use crate::domain_model::*;
use chrono::{DateTime, Utc};

/// Durable last-seen timestamps, written when a user's connection count
/// drops to zero. Presence itself is derived, never stored.
#[async_trait::async_trait]
pub trait PresenceStore: Send + Sync {
    async fn save_last_seen(&self, user: UserId, at: DateTime<Utc>) -> anyhow::Result<()>;
    async fn last_seen(&self, user: UserId) -> anyhow::Result<Option<DateTime<Utc>>>;
}
