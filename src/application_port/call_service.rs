use crate::domain_model::*;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("call not found")]
    CallNotFound,
    #[error("caller already in an active call")]
    CallerBusy,
    #[error("callee already in an active call")]
    CalleeBusy,
    #[error("operation not legal in the call's current state")]
    InvalidState,
    #[error("user is not a participant of this call")]
    NotParticipant,
}

/// The signaling handshake between exactly two parties. Media bytes flow
/// peer-to-peer once signaling completes; none of them pass through here.
#[async_trait::async_trait]
pub trait CallService: Send + Sync {
    /// Creates a ringing session and starts the ring-timeout timer.
    async fn invite(
        &self,
        caller: UserId,
        callee: UserId,
        call_type: CallType,
    ) -> Result<CallSession, CallError>;

    /// Legal only while ringing; reject is terminal.
    async fn answer(
        &self,
        call_id: CallId,
        by: UserId,
        accepted: bool,
    ) -> Result<CallSession, CallError>;

    /// Verbatim relay to the other party. Allowed while ringing (early ICE)
    /// or accepted.
    async fn relay_sdp(
        &self,
        call_id: CallId,
        sender: UserId,
        sdp: &str,
        sdp_type: &str,
    ) -> Result<(), CallError>;

    async fn relay_ice(
        &self,
        call_id: CallId,
        sender: UserId,
        candidate: &str,
        sdp_mid: Option<&str>,
        sdp_mline_index: Option<u32>,
    ) -> Result<(), CallError>;

    /// Idempotent: hanging up an already-ended call is a no-op success, and
    /// the session ends exactly once under concurrent hangups.
    async fn hangup(
        &self,
        call_id: CallId,
        by: UserId,
        detail: Option<String>,
    ) -> Result<(), CallError>;
}
