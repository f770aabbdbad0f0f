use crate::domain_model::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum C2SCommand {
    ChatMessageSend(ChatMessageSend),
    ChatMessageEdit(ChatMessageEdit),
    ChatMessageRecall(ChatMessageRecall),
    ChatMarkRead(ChatMarkRead),
    CallInvite(CallInvite),
    CallAnswer(CallAnswer),
    CallSdp(CallSdp),
    CallIce(CallIce),
    CallHangup(CallHangup),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessageSend {
    pub to: ConversationKey,
    pub message_id: MessageId,
    pub kind: MessageKind,
    pub content: String,
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessageEdit {
    pub message_id: MessageId,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessageRecall {
    pub message_id: MessageId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMarkRead {
    pub to: ConversationKey,
    pub up_to: SequenceNumber,
}

// Call signaling payloads carry a timestamp for client-side display
// ordering only; the coordinator's state machine is the authority.

#[derive(Debug, Serialize, Deserialize)]
pub struct CallInvite {
    pub callee: UserId,
    pub call_type: CallType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallAnswer {
    pub call_id: CallId,
    pub accepted: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallSdp {
    pub call_id: CallId,
    pub sdp: String,
    pub sdp_type: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallIce {
    pub call_id: CallId,
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallHangup {
    pub call_id: CallId,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Envelope placed on the event bus by the outbox dispatcher; the fan-out
/// consumer unwraps it and routes `body` to each receiver's devices.
#[derive(Debug, Serialize, Deserialize)]
pub struct S2CEnvelope {
    pub receivers: Vec<UserId>,
    pub body: S2CEvent,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum S2CEvent {
    ChatMessageAck(ChatMessageAck),
    ChatMessageNew(ChatMessageNew),
    ChatMessageEdited(ChatMessageEdited),
    ChatMessageRecalled(ChatMessageRecalled),
    PresenceChanged(PresenceUpdate),
    CallRinging(CallRinging),
    CallInvited(CallInvited),
    CallAnswered(CallAnswered),
    CallSdp(CallSdpRelay),
    CallIce(CallIceRelay),
    CallEnded(CallEnded),
    Error(WireError),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessageAck {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub sequence: SequenceNumber,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessageNew {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub sequence: SequenceNumber,
    pub sender: UserId,
    pub kind: MessageKind,
    pub content: String,
    pub reply_to: Option<MessageId>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessageEdited {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub sequence: SequenceNumber,
    pub content: String,
    pub edited_at: DateTime<Utc>,
}

/// A recall marker, not a hole: catch-up consumers still see the sequence.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessageRecalled {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub sequence: SequenceNumber,
    pub recalled_at: DateTime<Utc>,
}

/// Synchronous reply to the caller: the session exists and the callee's
/// devices are being rung.
#[derive(Debug, Serialize, Deserialize)]
pub struct CallRinging {
    pub call_id: CallId,
    pub callee: UserId,
    pub call_type: CallType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallInvited {
    pub call_id: CallId,
    pub caller: UserId,
    pub call_type: CallType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallAnswered {
    pub call_id: CallId,
    pub accepted: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallSdpRelay {
    pub call_id: CallId,
    pub sender: UserId,
    pub sdp: String,
    pub sdp_type: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallIceRelay {
    pub call_id: CallId,
    pub sender: UserId,
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallEnded {
    pub call_id: CallId,
    pub reason: EndReason,
    /// Free-form reason supplied by the hanging-up client, relayed as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c2s_send_round_trips_through_the_tagged_form() {
        let cmd = C2SCommand::ChatMessageSend(ChatMessageSend {
            to: ConversationKey::user(UserId(uuid::Uuid::new_v4())),
            message_id: MessageId(uuid::Uuid::new_v4()),
            kind: MessageKind::Text,
            content: "hi".to_owned(),
            reply_to: None,
        });
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""type":"chatmessagesend""#));
        let back: C2SCommand = serde_json::from_str(&json).unwrap();
        match back {
            C2SCommand::ChatMessageSend(data) => assert_eq!(data.content, "hi"),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn s2c_envelope_keeps_receivers_separate_from_body() {
        let receiver = UserId(uuid::Uuid::new_v4());
        let envelope = S2CEnvelope {
            receivers: vec![receiver],
            body: S2CEvent::CallEnded(CallEnded {
                call_id: CallId::random(),
                reason: EndReason::TimedOut,
                detail: None,
                timestamp: Utc::now(),
            }),
        };
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let back: S2CEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.receivers, vec![receiver]);
        assert!(matches!(back.body, S2CEvent::CallEnded(_)));
    }
}
