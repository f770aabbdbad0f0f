use crate::application_impl::*;
use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use crate::infra_mysql::*;
use crate::infra_redis::*;
use crate::server::*;
use crate::settings::Settings;
use chrono::Duration as ChronoDuration;
use nanoid::nanoid;
use sqlx::{MySql, Pool};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Server {
    pub conversation_service: Arc<dyn ConversationService>,
    pub call_service: Arc<dyn CallService>,
    pub authenticator: Arc<dyn Authenticator>,
    pub connection_acceptor: Arc<dyn ConnectionAcceptor>,
    pub presence: Arc<PresenceTracker>,
    fanout_handle: Mutex<Option<JoinHandle<()>>>,
    notifier_handle: Mutex<Option<JoinHandle<()>>>,
    presence_handle: Mutex<Option<JoinHandle<()>>>,
    presence_fanout_handle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    session_hub: Arc<SessionHub>,
    pool: Pool<MySql>,
}

impl Server {
    pub async fn try_new(settings: &Settings) -> anyhow::Result<Self> {
        let alphabet: [char; 16] = [
            '1', '2', '3', '4', '5', '6', '7', '8', '9', '0', 'a', 'b', 'c', 'd', 'e', 'f',
        ];
        let run_id = nanoid!(10, &alphabet);

        let redis_client = redis::Client::open(settings.redis.dsn.as_str())?;
        let redis_manager = redis_client.get_connection_manager().await?;
        // last-seen data outlives the process, so no run_id in the prefix
        let presence_store: Arc<dyn PresenceStore> =
            Arc::new(RedisPresenceStore::new(redis_manager, "presence"));

        let pool = Pool::<MySql>::connect(settings.mysql.dsn.as_str()).await?;
        let tx_manager: Arc<dyn TxManager> = Arc::new(MySqlTxManager::new(pool.clone()));

        let key = std::env::var("JWT_SIGNING_KEY")
            .unwrap_or_else(|_| settings.auth.signing_key.clone())
            .into_bytes();
        let authenticator: Arc<dyn Authenticator> = Arc::new(JwtHs256Verifier::new(&key));

        let message_repo: Arc<dyn MessageRepo> = Arc::new(MySqlMessageRepo::new(pool.clone()));
        let outbox_repo: Arc<dyn OutboxRepo> = Arc::new(MySqlOutboxRepo::new(pool.clone()));
        let group_repo: Arc<dyn GroupRepo> = Arc::new(MySqlGroupRepo::new(pool.clone()));
        let access: Arc<dyn AccessPolicy> = Arc::new(MembershipAccessPolicy::new(
            group_repo.clone(),
            tx_manager.clone(),
        ));

        let conversation_service: Arc<dyn ConversationService> =
            Arc::new(RealConversationService::new(
                message_repo,
                group_repo.clone(),
                outbox_repo.clone(),
                access,
                tx_manager.clone(),
                ChatPolicy {
                    edit_window: ChronoDuration::minutes(settings.chat.edit_window_minutes),
                    recall_window: ChronoDuration::minutes(settings.chat.recall_window_minutes),
                    catch_up_limit: settings.chat.catch_up_limit,
                },
            ));

        // region runtime infra
        let cancel = CancellationToken::new();

        let (registry_events_tx, registry_events_rx) = tokio::sync::mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry::new(registry_events_tx));
        let router: Arc<dyn DeliveryRouter> =
            Arc::new(ConnectionRouter::new(registry.clone(), group_repo.clone()));

        let call_service: Arc<dyn CallService> = Arc::new(CallCoordinator::new(
            router.clone(),
            CallPolicy {
                ring_timeout: Duration::from_secs(settings.call.ring_timeout_secs),
            },
            cancel.clone(),
        ));

        let presence = Arc::new(PresenceTracker::new(presence_store));
        let presence_handle = tokio::spawn(
            presence
                .clone()
                .run(registry_events_rx, cancel.clone()),
        );
        let presence_fanout_handle = tokio::spawn(presence_fanout(
            presence.clone(),
            registry.clone(),
            router.clone(),
            cancel.clone(),
        ));

        let topic = format!("chat.event.{}", run_id);

        let publisher: Arc<dyn EventPublisher> = Arc::new(KafkaPublisher::new(
            settings.kafka.bootstrap_server.as_str(),
            &format!("chat-pub-{}", run_id),
        )?);
        let consumer: Arc<dyn EventConsumer> = Arc::new(KafkaConsumer::new(
            settings.kafka.bootstrap_server.as_str(),
            &format!("chat-sub-{}", run_id),
            cancel.clone(),
        ));

        let service_registry = Arc::new(ServiceRegistry {
            conversation_service: conversation_service.clone(),
            call_service: call_service.clone(),
        });
        let session_hub = Arc::new(SessionHub::new(registry.clone(), service_registry));
        let connection_acceptor: Arc<dyn ConnectionAcceptor> = session_hub.clone();

        let fanout_handler: Arc<dyn EventHandler> = Arc::new(ConnFanoutHandler::new(router));
        let notifier = Notifier::new(
            tx_manager,
            outbox_repo,
            publisher,
            &topic,
            OutboxPolicy {
                poll_interval: Duration::from_millis(settings.outbox.poll_interval_ms),
                batch_size: settings.outbox.batch_size,
                max_attempts: settings.outbox.max_attempts,
                backoff_base: ChronoDuration::milliseconds(settings.outbox.backoff_base_ms),
                backoff_cap: ChronoDuration::milliseconds(settings.outbox.backoff_cap_ms),
            },
            cancel.clone(),
        );

        let run_id_clone = run_id.clone();
        let fanout_handle = tokio::spawn(async move {
            let _ = consumer
                .run(
                    &format!("ws-fanout-{}", run_id_clone),
                    &[&topic],
                    fanout_handler,
                )
                .await;
        });
        let notifier_handle = tokio::spawn(async move {
            let _ = notifier.run().await;
        });

        // endregion

        tracing::info!("server started");

        Ok(Self {
            conversation_service,
            call_service,
            authenticator,
            connection_acceptor,
            presence,
            fanout_handle: Mutex::new(Some(fanout_handle)),
            notifier_handle: Mutex::new(Some(notifier_handle)),
            presence_handle: Mutex::new(Some(presence_handle)),
            presence_fanout_handle: Mutex::new(Some(presence_fanout_handle)),
            cancel,
            session_hub,
            pool,
        })
    }

    pub async fn shutdown(&self) {
        tracing::info!("server shutting down...");

        self.cancel.cancel();

        for slot in [
            &self.notifier_handle,
            &self.fanout_handle,
            &self.presence_handle,
            &self.presence_fanout_handle,
        ] {
            let handle = match slot.lock() {
                Ok(mut lock) => lock.take(),
                Err(_) => None,
            };
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }

        self.session_hub.shutdown().await;
        self.pool.close().await;
    }
}

/// Pushes presence transitions to everyone currently connected. With no
/// contact graph inside the delivery core, "interested parties" means all
/// online users; the push is cheap and offline users never see it anyway.
async fn presence_fanout(
    presence: Arc<PresenceTracker>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<dyn DeliveryRouter>,
    cancel: CancellationToken,
) {
    let mut updates = presence.subscribe();
    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => break,
            u = updates.recv() => match u {
                Ok(u) => u,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("presence fan-out lagged, skipped {skipped}");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let event = S2CEvent::PresenceChanged(update);
        let mut seen = HashSet::new();
        for record in registry.all() {
            if seen.insert(record.user_id) {
                if let Err(e) = router.deliver(Recipient::User(record.user_id), &event).await {
                    tracing::warn!("presence push to [{}] dropped: {e}", record.user_id);
                }
            }
        }
    }
}
