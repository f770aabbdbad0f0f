use crate::domain_model::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CallId(pub uuid::Uuid);

impl CallId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

/// Why a call reached its terminal state.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Rejected,
    Cancelled,
    TimedOut,
    HungUp,
}

/// Absence of a session is the idle state; a stored session is always in
/// one of these.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Ringing,
    Accepted,
    Ended,
}

/// The single authoritative record for one call. Wire DTOs are derived
/// views of this, never a second source of truth.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: CallId,
    pub caller: UserId,
    pub callee: UserId,
    pub call_type: CallType,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl CallSession {
    pub fn ring(caller: UserId, callee: UserId, call_type: CallType) -> Self {
        Self {
            call_id: CallId::random(),
            caller,
            callee,
            call_type,
            state: CallState::Ringing,
            started_at: Utc::now(),
            ended_at: None,
            end_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state == CallState::Ended
    }

    pub fn is_participant(&self, user: UserId) -> bool {
        self.caller == user || self.callee == user
    }

    /// The relay target: whichever party `user` is not.
    pub fn other_party(&self, user: UserId) -> Option<UserId> {
        if user == self.caller {
            Some(self.callee)
        } else if user == self.callee {
            Some(self.caller)
        } else {
            None
        }
    }
}
