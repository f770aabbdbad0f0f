use crate::application_port::*;
use crate::domain_model::*;
use crate::server::{DeliveryRouter, Recipient};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct CallPolicy {
    pub ring_timeout: Duration,
}

#[derive(Default)]
struct CallTable {
    sessions: HashMap<CallId, CallSession>,
    /// One active call per user; the value is the call holding them busy.
    busy: HashMap<UserId, CallId>,
}

impl CallTable {
    /// Removes the session and both busy entries, stamping the terminal
    /// state. The single exit path, so a call ends exactly once.
    fn end(&mut self, call_id: CallId, reason: EndReason) -> Option<CallSession> {
        let mut session = self.sessions.remove(&call_id)?;
        session.state = CallState::Ended;
        session.end_reason = Some(reason);
        session.ended_at = Some(Utc::now());
        for user in [session.caller, session.callee] {
            if self.busy.get(&user) == Some(&call_id) {
                self.busy.remove(&user);
            }
        }
        Some(session)
    }
}

/// In-memory signaling state machine for 1:1 calls. Sessions live only
/// while ringing or accepted; a terminal call leaves the table, so a late
/// hangup finds nothing and succeeds as a no-op.
pub struct CallCoordinator {
    table: Arc<Mutex<CallTable>>,
    router: Arc<dyn DeliveryRouter>,
    policy: CallPolicy,
    cancel: CancellationToken,
}

impl CallCoordinator {
    pub fn new(
        router: Arc<dyn DeliveryRouter>,
        policy: CallPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            table: Arc::new(Mutex::new(CallTable::default())),
            router,
            policy,
            cancel,
        }
    }

    pub fn active_call_of(&self, user: UserId) -> Option<CallId> {
        self.table.lock().expect("call table poisoned").busy.get(&user).copied()
    }

    async fn notify(&self, user: UserId, event: &S2CEvent) {
        if let Err(e) = self.router.deliver(Recipient::User(user), event).await {
            tracing::error!("failed to deliver call event to [{}]: {e:#}", user);
        }
    }

    async fn notify_ended(&self, session: &CallSession, reason: EndReason, detail: Option<String>) {
        let event = S2CEvent::CallEnded(CallEnded {
            call_id: session.call_id,
            reason,
            detail,
            timestamp: session.ended_at.unwrap_or_else(Utc::now),
        });
        self.notify(session.caller, &event).await;
        self.notify(session.callee, &event).await;
    }
}

#[async_trait::async_trait]
impl CallService for CallCoordinator {
    async fn invite(
        &self,
        caller: UserId,
        callee: UserId,
        call_type: CallType,
    ) -> Result<CallSession, CallError> {
        let session = {
            let mut table = self.table.lock().expect("call table poisoned");
            if table.busy.contains_key(&caller) {
                return Err(CallError::CallerBusy);
            }
            if table.busy.contains_key(&callee) {
                return Err(CallError::CalleeBusy);
            }
            let session = CallSession::ring(caller, callee, call_type);
            table.busy.insert(caller, session.call_id);
            table.busy.insert(callee, session.call_id);
            table.sessions.insert(session.call_id, session.clone());
            session
        };

        self.notify(
            callee,
            &S2CEvent::CallInvited(CallInvited {
                call_id: session.call_id,
                caller,
                call_type,
                timestamp: session.started_at,
            }),
        )
        .await;

        tokio::spawn(ring_timeout_watch(
            self.table.clone(),
            self.router.clone(),
            session.call_id,
            self.policy.ring_timeout,
            self.cancel.clone(),
        ));

        tracing::info!("call {} ringing: {} -> {}", session.call_id, caller, callee);
        Ok(session)
    }

    async fn answer(
        &self,
        call_id: CallId,
        by: UserId,
        accepted: bool,
    ) -> Result<CallSession, CallError> {
        let (session, ended) = {
            let mut table = self.table.lock().expect("call table poisoned");
            let session = table.sessions.get(&call_id).ok_or(CallError::CallNotFound)?;
            // the caller is a participant, just on the wrong side of the
            // invite; NotParticipant is reserved for true outsiders
            if by == session.caller {
                return Err(CallError::InvalidState);
            }
            if session.callee != by {
                return Err(CallError::NotParticipant);
            }
            if session.state != CallState::Ringing {
                return Err(CallError::InvalidState);
            }
            if accepted {
                let session = table
                    .sessions
                    .get_mut(&call_id)
                    .ok_or(CallError::CallNotFound)?;
                session.state = CallState::Accepted;
                (session.clone(), false)
            } else {
                let session = table
                    .end(call_id, EndReason::Rejected)
                    .ok_or(CallError::CallNotFound)?;
                (session, true)
            }
        };

        if ended {
            self.notify_ended(&session, EndReason::Rejected, None).await;
        } else {
            let event = S2CEvent::CallAnswered(CallAnswered {
                call_id,
                accepted: true,
                timestamp: Utc::now(),
            });
            self.notify(session.caller, &event).await;
            self.notify(session.callee, &event).await;
        }
        Ok(session)
    }

    async fn relay_sdp(
        &self,
        call_id: CallId,
        sender: UserId,
        sdp: &str,
        sdp_type: &str,
    ) -> Result<(), CallError> {
        let target = relay_target(&self.table, call_id, sender)?;
        self.notify(
            target,
            &S2CEvent::CallSdp(CallSdpRelay {
                call_id,
                sender,
                sdp: sdp.to_owned(),
                sdp_type: sdp_type.to_owned(),
                timestamp: Utc::now(),
            }),
        )
        .await;
        Ok(())
    }

    async fn relay_ice(
        &self,
        call_id: CallId,
        sender: UserId,
        candidate: &str,
        sdp_mid: Option<&str>,
        sdp_mline_index: Option<u32>,
    ) -> Result<(), CallError> {
        let target = relay_target(&self.table, call_id, sender)?;
        self.notify(
            target,
            &S2CEvent::CallIce(CallIceRelay {
                call_id,
                sender,
                candidate: candidate.to_owned(),
                sdp_mid: sdp_mid.map(str::to_owned),
                sdp_mline_index,
                timestamp: Utc::now(),
            }),
        )
        .await;
        Ok(())
    }

    async fn hangup(
        &self,
        call_id: CallId,
        by: UserId,
        detail: Option<String>,
    ) -> Result<(), CallError> {
        let ended = {
            let mut table = self.table.lock().expect("call table poisoned");
            let session = match table.sessions.get(&call_id) {
                Some(s) => s,
                // already ended, concurrent hangup or timeout got there first
                None => return Ok(()),
            };
            if !session.is_participant(by) {
                return Err(CallError::NotParticipant);
            }
            let reason = match session.state {
                CallState::Ringing if by == session.caller => EndReason::Cancelled,
                CallState::Ringing => EndReason::Rejected,
                _ => EndReason::HungUp,
            };
            table.end(call_id, reason).map(|s| (s, reason))
        };

        if let Some((session, reason)) = ended {
            tracing::info!("call {} ended: {:?}", call_id, reason);
            self.notify_ended(&session, reason, detail).await;
        }
        Ok(())
    }
}

/// Ends a still-ringing call after the timeout. A session that was
/// answered or hung up in the meantime is left alone.
async fn ring_timeout_watch(
    table: Arc<Mutex<CallTable>>,
    router: Arc<dyn DeliveryRouter>,
    call_id: CallId,
    timeout: Duration,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(timeout) => {}
    }

    let timed_out = {
        let mut table = table.lock().expect("call table poisoned");
        match table.sessions.get(&call_id) {
            Some(s) if s.state == CallState::Ringing => table.end(call_id, EndReason::TimedOut),
            _ => None,
        }
    };

    if let Some(session) = timed_out {
        tracing::info!("call {} timed out while ringing", call_id);
        let event = S2CEvent::CallEnded(CallEnded {
            call_id,
            reason: EndReason::TimedOut,
            detail: None,
            timestamp: session.ended_at.unwrap_or_else(Utc::now),
        });
        for user in [session.caller, session.callee] {
            if let Err(e) = router.deliver(Recipient::User(user), &event).await {
                tracing::error!("failed to deliver timeout to [{}]: {e:#}", user);
            }
        }
    }
}

fn relay_target(
    table: &Mutex<CallTable>,
    call_id: CallId,
    sender: UserId,
) -> Result<UserId, CallError> {
    let table = table.lock().expect("call table poisoned");
    let session = table.sessions.get(&call_id).ok_or(CallError::CallNotFound)?;
    session.other_party(sender).ok_or(CallError::NotParticipant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    #[derive(Default)]
    struct RecordingRouter {
        delivered: Mutex<StdHashMap<UserId, Vec<S2CEvent>>>,
    }

    impl RecordingRouter {
        fn events_for(&self, user: UserId) -> Vec<String> {
            self.delivered
                .lock()
                .unwrap()
                .get(&user)
                .map(|events| {
                    events
                        .iter()
                        .map(|e| serde_json::to_value(e).unwrap()["type"]
                            .as_str()
                            .unwrap()
                            .to_owned())
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    #[async_trait::async_trait]
    impl DeliveryRouter for RecordingRouter {
        async fn deliver(&self, recipient: Recipient, event: &S2CEvent) -> anyhow::Result<()> {
            let user = match recipient {
                Recipient::User(u) => u,
                Recipient::Group(_) => panic!("call events never target groups"),
            };
            let copy: S2CEvent = serde_json::from_value(serde_json::to_value(event)?)?;
            self.delivered.lock().unwrap().entry(user).or_default().push(copy);
            Ok(())
        }
    }

    fn coordinator(ring_timeout: Duration) -> (CallCoordinator, Arc<RecordingRouter>) {
        let router = Arc::new(RecordingRouter::default());
        let coordinator = CallCoordinator::new(
            router.clone(),
            CallPolicy { ring_timeout },
            CancellationToken::new(),
        );
        (coordinator, router)
    }

    fn user() -> UserId {
        UserId(uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn invite_rings_the_callee_and_answer_reaches_both() {
        let (coordinator, router) = coordinator(Duration::from_secs(45));
        let (alice, bob) = (user(), user());

        let session = coordinator.invite(alice, bob, CallType::Video).await.unwrap();
        assert_eq!(session.state, CallState::Ringing);
        assert_eq!(router.events_for(bob), vec!["callinvited"]);

        let answered = coordinator.answer(session.call_id, bob, true).await.unwrap();
        assert_eq!(answered.state, CallState::Accepted);
        assert_eq!(router.events_for(alice), vec!["callanswered"]);
        assert_eq!(router.events_for(bob), vec!["callinvited", "callanswered"]);
    }

    #[tokio::test]
    async fn a_busy_party_cannot_be_invited() {
        let (coordinator, _router) = coordinator(Duration::from_secs(45));
        let (alice, bob, carol) = (user(), user(), user());

        coordinator.invite(alice, bob, CallType::Audio).await.unwrap();

        assert!(matches!(
            coordinator.invite(carol, bob, CallType::Audio).await,
            Err(CallError::CalleeBusy)
        ));
        assert!(matches!(
            coordinator.invite(alice, carol, CallType::Audio).await,
            Err(CallError::CallerBusy)
        ));
    }

    #[tokio::test]
    async fn only_the_callee_may_answer_and_only_while_ringing() {
        let (coordinator, _router) = coordinator(Duration::from_secs(45));
        let (alice, bob) = (user(), user());
        let session = coordinator.invite(alice, bob, CallType::Audio).await.unwrap();

        // the caller answering their own invite is a state error, not an
        // outsider error
        assert!(matches!(
            coordinator.answer(session.call_id, alice, true).await,
            Err(CallError::InvalidState)
        ));
        let outsider = user();
        assert!(matches!(
            coordinator.answer(session.call_id, outsider, true).await,
            Err(CallError::NotParticipant)
        ));

        coordinator.answer(session.call_id, bob, true).await.unwrap();
        assert!(matches!(
            coordinator.answer(session.call_id, bob, true).await,
            Err(CallError::InvalidState)
        ));
    }

    #[tokio::test]
    async fn rejecting_ends_the_call_and_frees_both_parties() {
        let (coordinator, router) = coordinator(Duration::from_secs(45));
        let (alice, bob) = (user(), user());
        let session = coordinator.invite(alice, bob, CallType::Audio).await.unwrap();

        let ended = coordinator.answer(session.call_id, bob, false).await.unwrap();
        assert_eq!(ended.end_reason, Some(EndReason::Rejected));
        assert!(coordinator.active_call_of(alice).is_none());
        assert!(coordinator.active_call_of(bob).is_none());
        assert_eq!(router.events_for(alice), vec!["callended"]);
    }

    #[tokio::test]
    async fn sdp_and_ice_are_relayed_to_the_other_party_only() {
        let (coordinator, router) = coordinator(Duration::from_secs(45));
        let (alice, bob) = (user(), user());
        let session = coordinator.invite(alice, bob, CallType::Video).await.unwrap();
        coordinator.answer(session.call_id, bob, true).await.unwrap();

        coordinator
            .relay_sdp(session.call_id, alice, "v=0...", "offer")
            .await
            .unwrap();
        coordinator
            .relay_ice(session.call_id, bob, "candidate:1", Some("0"), Some(0))
            .await
            .unwrap();

        assert!(router.events_for(bob).contains(&"callsdp".to_owned()));
        assert!(router.events_for(alice).contains(&"callice".to_owned()));

        let outsider = user();
        assert!(matches!(
            coordinator
                .relay_sdp(session.call_id, outsider, "v=0...", "answer")
                .await,
            Err(CallError::NotParticipant)
        ));
    }

    #[tokio::test]
    async fn concurrent_hangups_end_the_call_exactly_once() {
        let (coordinator, router) = coordinator(Duration::from_secs(45));
        let (alice, bob) = (user(), user());
        let session = coordinator.invite(alice, bob, CallType::Audio).await.unwrap();
        coordinator.answer(session.call_id, bob, true).await.unwrap();

        coordinator.hangup(session.call_id, alice, None).await.unwrap();
        coordinator.hangup(session.call_id, bob, None).await.unwrap();
        coordinator.hangup(session.call_id, alice, None).await.unwrap();

        let ended_count = router
            .events_for(alice)
            .iter()
            .filter(|t| *t == "callended")
            .count();
        assert_eq!(ended_count, 1);
    }

    #[tokio::test]
    async fn hanging_up_an_unknown_call_is_a_no_op() {
        let (coordinator, _router) = coordinator(Duration::from_secs(45));
        coordinator.hangup(CallId::random(), user(), None).await.unwrap();
    }

    #[tokio::test]
    async fn a_caller_hangup_while_ringing_is_a_cancel() {
        let (coordinator, router) = coordinator(Duration::from_secs(45));
        let (alice, bob) = (user(), user());
        let session = coordinator.invite(alice, bob, CallType::Audio).await.unwrap();

        coordinator.hangup(session.call_id, alice, None).await.unwrap();

        let events = router.delivered.lock().unwrap();
        let ended = events
            .get(&bob)
            .unwrap()
            .iter()
            .find_map(|e| match e {
                S2CEvent::CallEnded(ended) => Some(ended.reason),
                _ => None,
            })
            .unwrap();
        assert_eq!(ended, EndReason::Cancelled);
    }

    #[tokio::test]
    async fn a_client_supplied_hangup_reason_reaches_the_other_party() {
        let (coordinator, router) = coordinator(Duration::from_secs(45));
        let (alice, bob) = (user(), user());
        let session = coordinator.invite(alice, bob, CallType::Audio).await.unwrap();
        coordinator.answer(session.call_id, bob, true).await.unwrap();

        coordinator
            .hangup(session.call_id, alice, Some("battery died".to_owned()))
            .await
            .unwrap();

        let events = router.delivered.lock().unwrap();
        let (reason, detail) = events
            .get(&bob)
            .unwrap()
            .iter()
            .find_map(|e| match e {
                S2CEvent::CallEnded(ended) => Some((ended.reason, ended.detail.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(reason, EndReason::HungUp);
        assert_eq!(detail.as_deref(), Some("battery died"));
    }

    #[tokio::test(start_paused = true)]
    async fn an_unanswered_call_times_out() {
        let (coordinator, router) = coordinator(Duration::from_secs(45));
        let (alice, bob) = (user(), user());
        let session = coordinator.invite(alice, bob, CallType::Audio).await.unwrap();

        // let the spawned watch register its timer before the clock moves
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(46)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(coordinator.active_call_of(alice).is_none());
        assert!(router.events_for(alice).contains(&"callended".to_owned()));

        // the timed-out call is gone, answering it is an error
        assert!(matches!(
            coordinator.answer(session.call_id, bob, true).await,
            Err(CallError::CallNotFound)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn an_answered_call_is_not_timed_out() {
        let (coordinator, router) = coordinator(Duration::from_secs(45));
        let (alice, bob) = (user(), user());
        let session = coordinator.invite(alice, bob, CallType::Audio).await.unwrap();
        coordinator.answer(session.call_id, bob, true).await.unwrap();

        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(120)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(coordinator.active_call_of(alice), Some(session.call_id));
        assert!(!router.events_for(alice).contains(&"callended".to_owned()));
    }
}
