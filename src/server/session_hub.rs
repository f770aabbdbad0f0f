use crate::application_port::*;
use crate::domain_model::*;
use crate::server::registry::{ConnectionRecord, ConnectionRegistry};
use crate::server::*;
use anyhow::anyhow;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

const MAILBOX_CAP: usize = 256;

pub struct ActorConfig {
    pub max_inflight_messages: usize,
    pub max_inflight_results: usize,
    pub max_worker_timeout_ms: u64,
}

pub struct ServiceRegistry {
    pub conversation_service: Arc<dyn ConversationService>,
    pub call_service: Arc<dyn CallService>,
}

/// Owns the per-connection actors. One actor per socket, looked up
/// through the shared [`ConnectionRegistry`] so a multi-device user keeps
/// one actor per device.
pub struct SessionHub {
    registry: Arc<ConnectionRegistry>,
    services: Arc<ServiceRegistry>,
}

impl SessionHub {
    pub fn new(registry: Arc<ConnectionRegistry>, services: Arc<ServiceRegistry>) -> Self {
        Self { registry, services }
    }

    pub async fn shutdown(&self) {
        tracing::info!("SessionHub shutting down...");

        let records = self.registry.all();
        for record in &records {
            record.cancellation_token.cancel();
        }

        let mut handles = Vec::new();
        for record in &records {
            if let Ok(mut lock) = record.actor_handle.lock() {
                if let Some(handle) = lock.take() {
                    handles.push(handle);
                }
            }
        }

        for handle in handles {
            let _ = handle.await;
        }

        tracing::info!("All SessionHub actors shut down.");
    }
}

// region connection acceptor

#[async_trait::async_trait]
impl ConnectionAcceptor for SessionHub {
    async fn accept_connection(
        &self,
        s2c_channel: Box<dyn ConnSender>,
        c2s_channel: Box<dyn ConnReceiver>,
        user_id: UserId,
    ) -> anyhow::Result<()> {
        let config = ActorConfig {
            max_inflight_messages: 64,
            max_inflight_results: 1024,
            max_worker_timeout_ms: 10_000,
        };

        let connection_id = ConnectionId::random();
        let services = self.services.clone();

        let actor_cancel = CancellationToken::new();

        let (sender_control_tx, sender_control_rx) = tokio::sync::mpsc::channel(MAILBOX_CAP);
        let (sender_buffer_tx, sender_buffer_rx) = tokio::sync::mpsc::channel(MAILBOX_CAP);

        let notify = Arc::new(Notify::new());
        let actor_handle = tokio::spawn(client_actor(
            connection_id,
            user_id,
            s2c_channel,
            c2s_channel,
            sender_control_tx.clone(),
            sender_control_rx,
            sender_buffer_rx,
            services,
            config,
            actor_cancel.clone(),
            notify.clone(),
            self.registry.clone(),
        ));

        let record = Arc::new(ConnectionRecord {
            connection_id,
            user_id,
            connected_at: Utc::now(),
            control: sender_control_tx,
            mailbox: sender_buffer_tx,
            actor_handle: Mutex::new(Some(actor_handle)),
            cancellation_token: actor_cancel,
        });
        self.registry.add(record);
        // the actor must not outrun its registry entry
        notify.notify_one();

        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn client_actor(
    connection_id: ConnectionId,
    user_id: UserId,
    s2c_channel: Box<dyn ConnSender>,
    c2s_channel: Box<dyn ConnReceiver>,
    sender_control_tx: Sender<ConnMessage>,
    sender_control_rx: Receiver<ConnMessage>,
    sender_data_rx: Receiver<ConnMessage>,
    services: Arc<ServiceRegistry>,
    config: ActorConfig,
    actor_cancel: CancellationToken,
    notify: Arc<Notify>,
    registry: Arc<ConnectionRegistry>,
) {
    notify.notified().await;
    tracing::info!("ClientActor [{}/{}] starting", user_id, connection_id);

    let sender_token = actor_cancel.clone();
    let sender_handle = tokio::spawn(outbound_sender(
        s2c_channel,
        sender_control_rx,
        sender_data_rx,
        sender_token,
    ));

    let receiver_token = actor_cancel.clone();
    let receiver_handle = tokio::spawn(inbound_receiver(
        user_id,
        c2s_channel,
        sender_control_tx,
        services,
        config,
        receiver_token,
    ));

    tokio::select! {
        res = sender_handle => {
            tracing::warn!("Sender task ended first ({:?}): {:?}", user_id, res);
        },
        res = receiver_handle => {
            tracing::warn!("Receiver task ended first ({:?}): {:?}", user_id, res);
        }
    };
    registry.remove(connection_id);
}

async fn outbound_sender(
    mut s2c_channel: Box<dyn ConnSender>,
    mut sender_control_rx: Receiver<ConnMessage>,
    mut sender_data_rx: Receiver<ConnMessage>,
    actor_cancel: CancellationToken,
) {
    while let Some(msg) = tokio::select! {
        biased;
        _ = actor_cancel.cancelled() => None,
        m = sender_control_rx.recv() => m,
        m = sender_data_rx.recv() => m,
    } {
        tracing::trace!("outbound_sender: {:?}", msg);
        if s2c_channel.send(msg).await.is_err() {
            tracing::trace!("outbound_sender shutting down");
            actor_cancel.cancel();
            break;
        }
    }
}

async fn inbound_receiver(
    user_id: UserId,
    mut c2s_channel: Box<dyn ConnReceiver>,
    sender_control_tx: Sender<ConnMessage>,
    services: Arc<ServiceRegistry>,
    config: ActorConfig,
    actor_cancel: CancellationToken,
) {
    let worker_sem = Arc::new(Semaphore::new(config.max_inflight_messages));
    let join_sem = Arc::new(Semaphore::new(config.max_inflight_results));

    let mut task_set = tokio::task::JoinSet::new();

    loop {
        let sender_control_tx = sender_control_tx.clone();
        let services = services.clone();
        let actor_cancel = actor_cancel.clone();

        tokio::select! {
            biased;

            _ = actor_cancel.cancelled() => {
                tracing::info!("ClientActor [{}] shutdown by cancel", user_id);
                break;
            },

            maybe_message = c2s_channel.next() => {
                let result = match maybe_message {
                    Some(result) => result,
                    None => break,  // connection closed
                };

                let conn_msg = match result {
                    Ok(m) => m,
                    Err(_) => break,  // low level error
                };

                let permit = match worker_sem.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::warn!("Client [{}] is throttled", user_id);
                        let _ = sender_control_tx.send(ConnMessage::Text(String::from("Too many messages"))).await;
                        continue;
                    }
                };

                let join_permit = match join_sem.try_acquire() {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::warn!("Client [{}] join-backlog limit reached", user_id);
                        continue;
                    }
                };
                join_permit.forget();

                let worker_timeout = Duration::from_millis(config.max_worker_timeout_ms);
                task_set.spawn(async move {
                    let _permit_guard = permit;
                    let fut = handle_incoming_message(
                        user_id,
                        conn_msg,
                        sender_control_tx,
                        services,
                        actor_cancel.clone(),
                    );
                    let result = tokio::time::timeout(worker_timeout, fut).await;
                    if result.is_err() {
                        tracing::warn!("Worker timeout for client [{}]", user_id);
                    }
                });
            }

            Some(join_result) = task_set.join_next() => {
                if let Err(e) = join_result {
                    tracing::error!("worker panicked: {e}");
                }
                join_sem.add_permits(1);
            }
        }
    }

    actor_cancel.cancel();
    while task_set.join_next().await.is_some() {}
    tracing::info!("ClientActor [{}] shutting down", user_id);
}

async fn handle_incoming_message(
    user_id: UserId,
    conn_msg: ConnMessage,
    sender_control_tx: Sender<ConnMessage>,
    services: Arc<ServiceRegistry>,
    actor_cancel: CancellationToken,
) -> anyhow::Result<()> {
    match conn_msg {
        ConnMessage::Text(t) => {
            if let Ok(request) = serde_json::from_str::<C2SCommand>(&t) {
                if let Some(reply) = dispatch_command(user_id, request, &services).await {
                    let _ = sender_control_tx
                        .send(ConnMessage::Text(serde_json::to_string(&reply)?))
                        .await;
                }
                Ok(())
            } else {
                tracing::error!("failed to deserialize message: {}", t);
                let result = sender_control_tx
                    .send(ConnMessage::Text("malformed message".to_owned()))
                    .await;
                match result {
                    Ok(_) => Ok(()),
                    Err(e) => Err(anyhow!(e)),
                }
            }
        }
        ConnMessage::Binary(_) => {
            tracing::error!("unexpected binary message from [{}]", user_id);
            Ok(())
        }
        ConnMessage::Ping => {
            sender_control_tx.send(ConnMessage::Pong).await?;
            Ok(())
        }
        ConnMessage::Pong => {
            tracing::error!("unexpected pong from [{}]", user_id);
            Ok(())
        }
        ConnMessage::Close => {
            actor_cancel.cancel();
            Ok(())
        }
    }
}

/// Runs one command against the services. `Some` is the direct reply to
/// the issuing device; fan-out to other parties goes through the outbox
/// and the call coordinator, never from here.
async fn dispatch_command(
    sender: UserId,
    request: C2SCommand,
    services: &ServiceRegistry,
) -> Option<S2CEvent> {
    let chat = &services.conversation_service;
    let call = &services.call_service;

    match request {
        C2SCommand::ChatMessageSend(data) => {
            let sent = chat
                .send_message(
                    sender,
                    data.to,
                    data.message_id,
                    data.kind,
                    data.content.as_str(),
                    data.reply_to,
                )
                .await;
            match sent {
                Ok(record) => Some(S2CEvent::ChatMessageAck(ChatMessageAck {
                    conversation_id: record.conversation_id,
                    message_id: record.message_id,
                    sequence: record.sequence,
                    sent_at: record.sent_at,
                })),
                Err(e) => {
                    tracing::error!("Failed to send message for [{}]: {e}", sender);
                    Some(chat_error_event(&e))
                }
            }
        }
        C2SCommand::ChatMessageEdit(data) => {
            let now = Utc::now();
            match chat
                .edit_message(sender, data.message_id, data.content.as_str(), now)
                .await
            {
                Ok(record) => Some(S2CEvent::ChatMessageEdited(ChatMessageEdited {
                    conversation_id: record.conversation_id,
                    message_id: record.message_id,
                    sequence: record.sequence,
                    content: record.content,
                    edited_at: record.edited_at.unwrap_or(now),
                })),
                Err(e) => Some(chat_error_event(&e)),
            }
        }
        C2SCommand::ChatMessageRecall(data) => {
            let now = Utc::now();
            match chat.recall_message(sender, data.message_id, now).await {
                Ok(record) => Some(S2CEvent::ChatMessageRecalled(ChatMessageRecalled {
                    conversation_id: record.conversation_id,
                    message_id: record.message_id,
                    sequence: record.sequence,
                    recalled_at: record.recalled_at.unwrap_or(now),
                })),
                Err(e) => Some(chat_error_event(&e)),
            }
        }
        C2SCommand::ChatMarkRead(data) => {
            match chat.mark_read(sender, data.to, data.up_to).await {
                Ok(()) => None,
                Err(e) => Some(chat_error_event(&e)),
            }
        }
        C2SCommand::CallInvite(data) => {
            match call.invite(sender, data.callee, data.call_type).await {
                Ok(session) => Some(S2CEvent::CallRinging(CallRinging {
                    call_id: session.call_id,
                    callee: session.callee,
                    call_type: session.call_type,
                    timestamp: session.started_at,
                })),
                Err(e) => Some(call_error_event(&e)),
            }
        }
        C2SCommand::CallAnswer(data) => {
            // both parties hear the outcome from the coordinator
            match call.answer(data.call_id, sender, data.accepted).await {
                Ok(_) => None,
                Err(e) => Some(call_error_event(&e)),
            }
        }
        C2SCommand::CallSdp(data) => {
            match call
                .relay_sdp(data.call_id, sender, data.sdp.as_str(), data.sdp_type.as_str())
                .await
            {
                Ok(()) => None,
                Err(e) => Some(call_error_event(&e)),
            }
        }
        C2SCommand::CallIce(data) => {
            match call
                .relay_ice(
                    data.call_id,
                    sender,
                    data.candidate.as_str(),
                    data.sdp_mid.as_deref(),
                    data.sdp_mline_index,
                )
                .await
            {
                Ok(()) => None,
                Err(e) => Some(call_error_event(&e)),
            }
        }
        C2SCommand::CallHangup(data) => match call.hangup(data.call_id, sender, data.reason).await {
            Ok(()) => None,
            Err(e) => Some(call_error_event(&e)),
        },
    }
}

fn chat_error_event(e: &ChatError) -> S2CEvent {
    let code = match e {
        ChatError::MessageNotFound => "not_found",
        ChatError::NotMember | ChatError::NotAuthor => "forbidden",
        ChatError::WindowExpired => "window_expired",
        ChatError::AlreadyRecalled => "invalid_state",
        ChatError::Store(_) => "transient",
    };
    S2CEvent::Error(WireError {
        code: code.to_owned(),
        message: e.to_string(),
    })
}

fn call_error_event(e: &CallError) -> S2CEvent {
    let code = match e {
        CallError::CallNotFound => "not_found",
        CallError::CallerBusy | CallError::CalleeBusy => "busy",
        CallError::InvalidState => "invalid_state",
        CallError::NotParticipant => "forbidden",
    };
    S2CEvent::Error(WireError {
        code: code.to_owned(),
        message: e.to_string(),
    })
}

// endregion
