use crate::domain_model::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate presence of one user across all devices. Derived from the
/// connection registry, never stored as independent state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub online: bool,
    /// Set on the transition to offline.
    pub last_seen: Option<DateTime<Utc>>,
}
