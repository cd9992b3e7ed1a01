//! The sync engine: owns every component, runs the background loop and
//! exposes the operations the UI layer calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use huddle_core::errors::{Error, Result};
use huddle_core::messaging::{
    DeliveryStatus, Message, MessageQuery, MessagingRepositoryTrait, NewMessage,
    ReadStateRepositoryTrait, UnreadBoundary, UnreadCount,
};
use huddle_core::sync::{
    ChangeStreamTransport, Clock, MutationAck, NewOutboxEntry, OutboxMutationKind,
    OutboxRepositoryTrait, RemoteBackend, SessionProvider, SyncCursorRepositoryTrait,
    SyncTrigger, TombstoneRepositoryTrait,
};

use crate::config::SyncEngineConfig;
use crate::outbox::{OutboxEvent, OutboxProcessor};
use crate::push_wake::{AppPresence, PushDisposition, PushPayload, PushWakeHandler};
use crate::read_tracker::{MarkReadResult, ReadTracker};
use crate::reconciler::{ReconcileMode, Reconciler};
use crate::subscription::{ChangeHandler, ConnectionState, SubscriptionManager};
use crate::tombstones::TombstoneManager;

/// Floor for the background loop delay while outbox work is due.
const MIN_LOOP_DELAY_MS: u64 = 250;

/// Collaborators the engine is assembled from.
pub struct SyncEngineDeps {
    pub messaging: Arc<dyn MessagingRepositoryTrait>,
    pub read_state: Arc<dyn ReadStateRepositoryTrait>,
    pub outbox: Arc<dyn OutboxRepositoryTrait>,
    pub tombstones: Arc<dyn TombstoneRepositoryTrait>,
    pub cursors: Arc<dyn SyncCursorRepositoryTrait>,
    pub backend: Arc<dyn RemoteBackend>,
    pub session: Arc<dyn SessionProvider>,
    pub transport: Arc<dyn ChangeStreamTransport>,
    pub clock: Arc<dyn Clock>,
}

/// An optimistic send: the stored message, its outbox position and a
/// receiver for the delivery outcome.
#[derive(Debug)]
pub struct LocalSend {
    pub message: Message,
    pub local_seq: i64,
    delivery: oneshot::Receiver<Result<MutationAck>>,
}

impl LocalSend {
    /// Resolves once the backend acknowledged the send, or with
    /// [`Error::Poisoned`] once it was given up on.
    pub async fn delivered(self) -> Result<MutationAck> {
        self.delivery.await.map_err(|_| {
            Error::Canceled(format!("Delivery watch for {} dropped", self.local_seq))
        })?
    }
}

pub struct SyncEngine {
    actor_id: String,
    config: SyncEngineConfig,
    clock: Arc<dyn Clock>,
    messaging: Arc<dyn MessagingRepositoryTrait>,
    outbox: Arc<OutboxProcessor>,
    subscription: Arc<SubscriptionManager>,
    read_tracker: Arc<ReadTracker>,
    tombstones: Arc<TombstoneManager>,
    reconciler: Arc<Reconciler>,
    push_wake: Arc<PushWakeHandler>,
    background_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(deps: SyncEngineDeps, config: SyncEngineConfig, actor_id: impl Into<String>) -> Arc<Self> {
        let actor_id = actor_id.into();
        let token_timeout = config.token_timeout();

        let outbox = Arc::new(OutboxProcessor::new(
            Arc::clone(&deps.outbox),
            Arc::clone(&deps.messaging),
            Arc::clone(&deps.backend),
            Arc::clone(&deps.session),
            Arc::clone(&deps.clock),
            config.outbox.clone(),
            token_timeout,
        ));
        let subscription = SubscriptionManager::new(
            deps.transport,
            Arc::clone(&deps.session),
            Arc::clone(&deps.messaging),
            config.stream.clone(),
            token_timeout,
            Some(actor_id.clone()),
        );
        let read_tracker = Arc::new(ReadTracker::new(
            deps.read_state,
            Arc::clone(&deps.messaging),
            Arc::clone(&deps.clock),
        ));
        let tombstones = TombstoneManager::new(
            Arc::clone(&deps.tombstones),
            Arc::clone(&deps.messaging),
            Arc::clone(&deps.clock),
            config.tombstones.clone(),
        );
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&deps.messaging),
            deps.cursors,
            Arc::clone(&deps.backend),
            Arc::clone(&deps.session),
            Arc::clone(&deps.clock),
            config.reconciler.clone(),
            token_timeout,
        ));
        let push_wake = Arc::new(PushWakeHandler::new(
            Arc::clone(&deps.messaging),
            deps.tombstones,
            deps.backend,
            deps.session,
            Arc::clone(&deps.clock),
            config.reconciler.fetch_timeout(),
            token_timeout,
        ));

        let engine = Arc::new(Self {
            actor_id,
            config,
            clock: deps.clock,
            messaging: deps.messaging,
            outbox,
            subscription,
            read_tracker,
            tombstones,
            reconciler,
            push_wake,
            background_task: Mutex::new(None),
        });
        engine.wire_listeners();
        engine
    }

    fn wire_listeners(&self) {
        let reconciler = Arc::clone(&self.reconciler);
        self.subscription.set_catch_up_listener(Arc::new(move || {
            spawn_reconcile(Arc::clone(&reconciler), ReconcileMode::Force);
        }));

        let outbox = Arc::clone(&self.outbox);
        self.tombstones
            .set_finalized_listener(Arc::new(move || outbox.trigger()));
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.subscription.state()
    }

    pub fn outbox_events(&self) -> broadcast::Receiver<OutboxEvent> {
        self.outbox.subscribe()
    }

    /// Purges expired tombstones, recovers interrupted sends, connects the
    /// change stream and starts the background loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if let Err(err) = self.tombstones.gc().await {
            warn!("[Engine] Tombstone GC failed: {}", err);
        }
        self.outbox.recover().await?;
        self.subscription.start();
        self.ensure_background_started().await;
        self.trigger(SyncTrigger::Startup);
        info!("[Engine] Started for {}", self.actor_id);
        Ok(())
    }

    async fn ensure_background_started(self: &Arc<Self>) {
        let mut guard = self.background_task.lock().await;
        if guard.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let engine = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            loop {
                let delay = engine.next_loop_delay();
                tokio::time::sleep(delay).await;
                engine.trigger(SyncTrigger::Periodic);
            }
        }));
    }

    /// Interval plus jitter, shortened while outbox entries are due sooner.
    fn next_loop_delay(&self) -> Duration {
        let jitter_ms = if self.config.periodic_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.config.periodic_jitter_ms)
        } else {
            0
        };
        let mut delay_ms = self.config.periodic_interval_ms.saturating_add(jitter_ms);

        match self.outbox.next_due_at() {
            Ok(Some(due_at)) => {
                let wait_ms = (due_at - self.clock.now_millis()).max(0) as u64;
                delay_ms = delay_ms.min(wait_ms.max(MIN_LOOP_DELAY_MS));
            }
            Ok(None) => {}
            Err(err) => debug!("[Engine] Could not read outbox schedule: {}", err),
        }
        Duration::from_millis(delay_ms)
    }

    /// Fans a trigger out to the components it concerns.
    pub fn trigger(self: &Arc<Self>, trigger: SyncTrigger) {
        debug!("[Engine] Trigger {:?}", trigger);
        match trigger {
            SyncTrigger::LocalMutation => self.outbox.trigger(),
            SyncTrigger::Periodic | SyncTrigger::Startup => {
                self.outbox.trigger();
                spawn_reconcile(Arc::clone(&self.reconciler), ReconcileMode::ChecksumGated);
            }
            SyncTrigger::AppResume | SyncTrigger::NetworkReconnected => {
                self.outbox.trigger();
                if self.subscription.state() == ConnectionState::Disconnected {
                    // A successful connect fetches what was missed.
                    self.subscription.request_reconnect();
                } else {
                    spawn_reconcile(Arc::clone(&self.reconciler), ReconcileMode::ChecksumGated);
                }
            }
            SyncTrigger::PushWake | SyncTrigger::Manual => {
                self.outbox.trigger();
                spawn_reconcile(Arc::clone(&self.reconciler), ReconcileMode::Force);
            }
        }
    }

    /// Stores the message optimistically and queues its delivery.
    pub async fn send_message(self: &Arc<Self>, new_message: NewMessage) -> Result<LocalSend> {
        if new_message.content.trim().is_empty() && new_message.image_url.is_none() {
            return Err(Error::InvalidInput("message has no content".to_string()));
        }
        let id = new_message
            .id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let now = self.clock.now_millis();
        let message = new_message.into_message(id.clone(), now);

        let request = NewOutboxEntry::new(
            OutboxMutationKind::SendMessage,
            message.conversation_id.clone(),
            message.actor_id.clone(),
            id.clone(),
            serde_json::to_value(&message)?,
            now,
        )
        .with_mutation_id(id);
        let entry = self
            .messaging
            .insert_local_message(message.clone(), request)
            .await?;
        let delivery = self.outbox.watch_delivery(entry.local_seq).await;

        self.trigger(SyncTrigger::LocalMutation);
        Ok(LocalSend {
            message,
            local_seq: entry.local_seq,
            delivery,
        })
    }

    /// Resolves when the send at `local_seq` is delivered or poisoned.
    pub async fn wait_for_delivery(&self, local_seq: i64) -> Result<MutationAck> {
        self.outbox
            .watch_delivery(local_seq)
            .await
            .await
            .map_err(|_: oneshot::error::RecvError| {
                Error::Canceled(format!("Delivery watch for {} dropped", local_seq))
            })?
    }

    pub fn delivery_status(&self, message_id: &str) -> Result<DeliveryStatus> {
        self.messaging.delivery_status(message_id)
    }

    pub async fn retry_send(self: &Arc<Self>, local_seq: i64) -> Result<bool> {
        let requeued = self.outbox.retry_dead(local_seq).await?;
        if requeued {
            self.trigger(SyncTrigger::LocalMutation);
        }
        Ok(requeued)
    }

    pub async fn discard_send(&self, local_seq: i64) -> Result<bool> {
        self.outbox.discard(local_seq).await
    }

    /// Hides the message now; the delete is permanent once the cancel window
    /// closes.
    pub async fn delete_message(&self, message_id: &str) -> Result<()> {
        self.tombstones
            .request_delete(message_id, &self.actor_id)
            .await
    }

    pub fn cancel_delete(&self, message_id: &str) -> Result<bool> {
        self.tombstones.cancel_delete(message_id)
    }

    /// Visible messages of a conversation, oldest first.
    pub fn messages(&self, conversation_id: &str, limit: Option<i64>) -> Result<Vec<Message>> {
        self.tombstones.visible_messages(&MessageQuery {
            limit,
            ..MessageQuery::conversation(conversation_id)
        })
    }

    /// Binds the change stream to the conversation and returns its unread
    /// boundary, applying `pending_mark` first.
    pub async fn open_conversation(
        &self,
        conversation_id: &str,
        pending_mark: Option<&str>,
        handler: Option<ChangeHandler>,
    ) -> Result<UnreadBoundary> {
        if let Err(err) = self
            .subscription
            .bind_conversation(Some(conversation_id.to_string()), handler)
            .await
        {
            warn!("[Engine] Could not rebind stream to {}: {}", conversation_id, err);
        }
        let boundary = self
            .read_tracker
            .open_conversation(conversation_id, &self.actor_id, pending_mark)
            .await?;
        if pending_mark.is_some() {
            self.outbox.trigger();
        }
        Ok(boundary)
    }

    pub async fn close_conversation(&self) -> Result<()> {
        self.subscription.bind_conversation(None, None).await?;
        Ok(())
    }

    pub async fn mark_read(&self, conversation_id: &str, message_id: &str) -> Result<MarkReadResult> {
        let result = self
            .read_tracker
            .mark_read(conversation_id, &self.actor_id, message_id)
            .await?;
        if result.receipt.is_some() {
            self.outbox.trigger();
        }
        Ok(result)
    }

    pub fn unread_counts(&self) -> Result<Vec<UnreadCount>> {
        self.read_tracker.unread_counts(&self.actor_id)
    }

    /// Handles a wake-up that only names the message. Falls back to a full
    /// reconcile when the message cannot be fetched on its own.
    pub async fn handle_push_hint(self: &Arc<Self>, entity_id: &str, conversation_id: &str) -> bool {
        let needs_reconcile = self
            .push_wake
            .fetch_if_absent(entity_id, conversation_id)
            .await;
        if needs_reconcile {
            self.trigger(SyncTrigger::PushWake);
        }
        needs_reconcile
    }

    /// Stores the message carried by a push and returns how to surface it.
    pub async fn handle_push_data(
        self: &Arc<Self>,
        data: &HashMap<String, String>,
        presence: &AppPresence,
    ) -> Result<PushDisposition> {
        let payload = match PushPayload::from_data(data) {
            Ok(payload) => payload,
            Err(err) => {
                let hint = (data.get("message_id"), data.get("group_id"));
                if let (Some(entity_id), Some(conversation_id)) = hint {
                    debug!("[Engine] Push data incomplete ({}), fetching instead", err);
                    self.handle_push_hint(entity_id, conversation_id).await;
                    return Ok(PushDisposition::Suppressed);
                }
                return Err(err);
            }
        };

        let ingest = self
            .push_wake
            .ingest_push_message(&payload, presence, Some(&self.actor_id))
            .await?;
        if ingest.needs_reconcile {
            self.trigger(SyncTrigger::PushWake);
        }
        Ok(ingest.disposition)
    }

    /// Drops the stream connection for logout. Queued mutations stay put.
    pub async fn logout(&self) {
        self.subscription.disconnect().await;
    }

    /// Stops background work. Pending deletes are finalized first.
    pub async fn stop(&self) {
        if let Some(handle) = self.background_task.lock().await.take() {
            handle.abort();
        }
        if let Err(err) = self.tombstones.flush().await {
            warn!("[Engine] Could not finalize pending deletes: {}", err);
        }
        self.subscription.stop().await;
        info!("[Engine] Stopped");
    }
}

fn spawn_reconcile(reconciler: Arc<Reconciler>, mode: ReconcileMode) {
    tokio::spawn(async move {
        if let Err(err) = reconciler.reconcile_all(mode).await {
            warn!("[Engine] Reconcile failed: {}", err);
        }
    });
}
