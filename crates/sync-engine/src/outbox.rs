//! Outbox processor: drains due mutations to the backend.
//!
//! Entries are claimed in `next_retry_at` order, sent concurrently under a
//! per-send timeout, and either deleted on success or rescheduled with
//! exponential backoff. An entry that fails past the retry ceiling, or that
//! the backend rejects outright, is poisoned: moved to `dead` and reported to
//! whoever is still waiting on it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, Mutex};

use huddle_core::errors::{Error, Result};
use huddle_core::messaging::MessagingRepositoryTrait;
use huddle_core::sync::{
    with_timeout, Clock, MutationAck, NewOutboxEntry, OutboxEntry, OutboxRepositoryTrait,
    OutboxStatus, RemoteBackend, SessionProvider, SyncRetryClass, SyncRow,
};

use crate::config::OutboxConfig;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Acks kept for watchers that arrive after delivery.
const RECENT_ACK_CAPACITY: usize = 256;

/// Delivery status changes, for UI badges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboxEvent {
    Delivered {
        local_seq: i64,
        mutation_id: String,
        entity_id: String,
    },
    Retrying {
        local_seq: i64,
        entity_id: String,
        retry_count: i32,
        next_retry_at: i64,
        error_code: String,
    },
    Poisoned {
        local_seq: i64,
        entity_id: String,
        retry_count: i32,
        reason: String,
    },
}

/// What one `drain()` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retried: usize,
    pub poisoned: usize,
    /// True when another drain was already running and absorbed this call.
    pub coalesced: bool,
}

impl DrainReport {
    fn absorb(&mut self, other: DrainReport) {
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.poisoned += other.poisoned;
    }
}

type DeliveryWaiter = oneshot::Sender<Result<MutationAck>>;

pub struct OutboxProcessor {
    repository: Arc<dyn OutboxRepositoryTrait>,
    messaging: Arc<dyn MessagingRepositoryTrait>,
    backend: Arc<dyn RemoteBackend>,
    session: Arc<dyn SessionProvider>,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
    token_timeout: std::time::Duration,
    waiters: Mutex<HashMap<i64, Vec<DeliveryWaiter>>>,
    recent_acks: StdMutex<VecDeque<(i64, MutationAck)>>,
    events: broadcast::Sender<OutboxEvent>,
    drain_lock: Mutex<()>,
    drain_requested: AtomicBool,
}

impl OutboxProcessor {
    pub fn new(
        repository: Arc<dyn OutboxRepositoryTrait>,
        messaging: Arc<dyn MessagingRepositoryTrait>,
        backend: Arc<dyn RemoteBackend>,
        session: Arc<dyn SessionProvider>,
        clock: Arc<dyn Clock>,
        config: OutboxConfig,
        token_timeout: std::time::Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            repository,
            messaging,
            backend,
            session,
            clock,
            config,
            token_timeout,
            waiters: Mutex::new(HashMap::new()),
            recent_acks: StdMutex::new(VecDeque::with_capacity(RECENT_ACK_CAPACITY)),
            events,
            drain_lock: Mutex::new(()),
            drain_requested: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboxEvent> {
        self.events.subscribe()
    }

    /// Appends a mutation. Delivery happens on the next drain.
    pub async fn enqueue(&self, request: NewOutboxEntry) -> Result<OutboxEntry> {
        let entry = self.repository.enqueue(request).await?;
        debug!(
            "[Outbox] Enqueued {:?} for {} (seq {})",
            entry.kind, entry.entity_id, entry.local_seq
        );
        Ok(entry)
    }

    /// Resolves once the entry is delivered (`Ok(ack)`) or poisoned
    /// (`Err(Error::Poisoned)`). Dropping the receiver is fine; the outcome is
    /// then discarded.
    pub async fn watch_delivery(&self, local_seq: i64) -> oneshot::Receiver<Result<MutationAck>> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().await;

        match self.repository.get_entry(local_seq) {
            Ok(Some(entry)) if entry.status == OutboxStatus::Dead => {
                let _ = tx.send(Err(poisoned_error(&entry, entry.last_error.clone())));
            }
            Ok(Some(_)) => waiters.entry(local_seq).or_default().push(tx),
            Ok(None) => match self.recent_ack(local_seq) {
                Some(ack) => {
                    let _ = tx.send(Ok(ack));
                }
                // Discarded, or delivered too long ago to remember.
                None => {
                    let _ = tx.send(Err(Error::NotFound(format!(
                        "Outbox entry {} is no longer queued",
                        local_seq
                    ))));
                }
            },
            Err(err) => {
                let _ = tx.send(Err(err));
            }
        }
        rx
    }

    /// Returns entries a killed process left in flight to the queue.
    pub async fn recover(&self) -> Result<usize> {
        let recovered = self.repository.recover_in_flight().await?;
        if recovered > 0 {
            info!("[Outbox] Recovered {} in-flight entr(ies)", recovered);
        }
        Ok(recovered)
    }

    /// Re-queues a dead entry with a fresh retry budget.
    pub async fn retry_dead(&self, local_seq: i64) -> Result<bool> {
        self.repository
            .requeue_dead(local_seq, self.clock.now_millis())
            .await
    }

    /// Drops an entry for good. A discarded send also removes its optimistic
    /// message.
    pub async fn discard(&self, local_seq: i64) -> Result<bool> {
        let discarded = self.repository.discard(local_seq).await?;
        if discarded {
            self.resolve_waiters(
                local_seq,
                Err(Error::Canceled(format!("Outbox entry {} discarded", local_seq))),
            )
            .await;
        }
        Ok(discarded)
    }

    pub fn next_due_at(&self) -> Result<Option<i64>> {
        self.repository.next_due_at()
    }

    pub fn entries(&self, status: Option<OutboxStatus>) -> Result<Vec<OutboxEntry>> {
        self.repository.list_entries(status)
    }

    /// Fire-and-forget [`drain`](Self::drain).
    pub fn trigger(self: &Arc<Self>) {
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = processor.drain().await {
                warn!("[Outbox] Drain failed: {}", err);
            }
        });
    }

    /// Processes every due entry. Concurrent calls coalesce into the running
    /// drain, which makes one more pass for them.
    pub async fn drain(&self) -> Result<DrainReport> {
        self.drain_requested.store(true, Ordering::SeqCst);
        let mut report = DrainReport::default();

        loop {
            let Ok(_guard) = self.drain_lock.try_lock() else {
                debug!("[Outbox] Drain already running; request coalesced");
                report.coalesced = true;
                return Ok(report);
            };
            while self.drain_requested.swap(false, Ordering::SeqCst) {
                loop {
                    let pass = self.drain_pass().await?;
                    let claimed = pass.delivered + pass.retried + pass.poisoned;
                    report.absorb(pass);
                    if claimed < self.config.batch_size.max(1) as usize {
                        break;
                    }
                }
            }
            drop(_guard);
            // A request that raced with the release above would otherwise be lost.
            if !self.drain_requested.load(Ordering::SeqCst) {
                break;
            }
        }

        if report.delivered + report.retried + report.poisoned > 0 {
            debug!(
                "[Outbox] Drain complete: delivered={} retried={} poisoned={}",
                report.delivered, report.retried, report.poisoned
            );
        }
        Ok(report)
    }

    async fn drain_pass(&self) -> Result<DrainReport> {
        let now = self.clock.now_millis();
        let claimed = self
            .repository
            .claim_due(now, self.config.batch_size.max(1))
            .await?;
        let mut report = DrainReport::default();
        if claimed.is_empty() {
            return Ok(report);
        }

        let token = match self.session.get_valid_token(self.token_timeout).await {
            Ok(token) => token,
            Err(err) => {
                warn!(
                    "[Outbox] No session for {} claimed entr(ies): {}",
                    claimed.len(),
                    err
                );
                let mut first_error = None;
                for entry in claimed {
                    let delay = self.config.backoff.delay(entry.retry_count.max(1) as u32);
                    let due_at = now + delay.as_millis() as i64;
                    if let Err(release_err) = self.release(&entry, &err, due_at).await {
                        warn!(
                            "[Outbox] Could not release seq {}: {}",
                            entry.local_seq, release_err
                        );
                        first_error.get_or_insert(release_err);
                    }
                }
                return first_error.map_or(Ok(report), Err);
            }
        };

        let send_timeout = self.config.send_timeout();
        let token = token.as_str();
        let results = stream::iter(claimed.into_iter().map(move |entry| async move {
            let result = with_timeout(send_timeout, self.backend.send_mutation(token, &entry)).await;
            (entry, result)
        }))
        .buffer_unordered(self.config.max_concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

        // Every claimed entry leaves in-flight before the pass returns, even
        // when recording one outcome fails.
        let mut reauth_needed = false;
        let mut first_error = None;
        for (entry, result) in results {
            let recorded = match result {
                Ok(ack) => match self.on_delivered(entry.clone(), ack).await {
                    Ok(()) => {
                        report.delivered += 1;
                        Ok(())
                    }
                    Err(err) => Err(err),
                },
                Err(err) => {
                    reauth_needed |= err.retry_class() == SyncRetryClass::ReauthRequired;
                    match self.on_failed(entry.clone(), err).await {
                        Ok(true) => {
                            report.poisoned += 1;
                            Ok(())
                        }
                        Ok(false) => {
                            report.retried += 1;
                            Ok(())
                        }
                        Err(err) => Err(err),
                    }
                }
            };
            if let Err(err) = recorded {
                warn!(
                    "[Outbox] Could not record outcome of seq {}, releasing it: {}",
                    entry.local_seq, err
                );
                if let Err(release_err) = self.release(&entry, &err, now).await {
                    warn!(
                        "[Outbox] Could not release seq {}: {}",
                        entry.local_seq, release_err
                    );
                }
                first_error.get_or_insert(err);
            }
        }
        if reauth_needed {
            self.session.reset().await;
        }
        first_error.map_or(Ok(report), Err)
    }

    async fn on_delivered(&self, entry: OutboxEntry, ack: MutationAck) -> Result<()> {
        self.remember_ack(entry.local_seq, &ack);
        self.repository.complete(entry.local_seq).await?;
        debug!(
            "[Outbox] Delivered {} (seq {}, attempt {})",
            entry.entity_id,
            entry.local_seq,
            entry.retry_count + 1
        );

        if let Some(row) = ack.row.clone() {
            self.apply_echo(row).await;
        }
        let _ = self.events.send(OutboxEvent::Delivered {
            local_seq: entry.local_seq,
            mutation_id: entry.mutation_id.clone(),
            entity_id: entry.entity_id.clone(),
        });
        self.resolve_waiters(entry.local_seq, Ok(ack)).await;
        Ok(())
    }

    /// The server's copy of a sent row replaces the optimistic one (LWW).
    async fn apply_echo(&self, row: SyncRow) {
        match self.messaging.apply_remote_rows(vec![row]).await {
            Ok(report) if !report.is_complete() => {
                warn!("[Outbox] Server echo not applied: {:?}", report.failure);
            }
            Ok(_) => {}
            Err(err) => warn!("[Outbox] Server echo not applied: {}", err),
        }
    }

    /// Returns true when the entry was poisoned.
    async fn on_failed(&self, entry: OutboxEntry, err: Error) -> Result<bool> {
        let retry_count = entry.retry_count + 1;
        let class = err.retry_class();
        let reason = err.to_string();

        if class == SyncRetryClass::Permanent || self.config.backoff.is_exhausted(retry_count) {
            self.repository
                .mark_dead(
                    entry.local_seq,
                    retry_count,
                    Some(reason.clone()),
                    Some(err.code()),
                )
                .await?;
            warn!(
                "[Outbox] Poisoned {} (seq {}) after {} attempt(s): {}",
                entry.entity_id, entry.local_seq, retry_count, reason
            );
            let _ = self.events.send(OutboxEvent::Poisoned {
                local_seq: entry.local_seq,
                entity_id: entry.entity_id.clone(),
                retry_count,
                reason: reason.clone(),
            });
            let poisoned = poisoned_error(
                &OutboxEntry {
                    retry_count,
                    ..entry.clone()
                },
                Some(reason),
            );
            self.resolve_waiters(entry.local_seq, Err(poisoned)).await;
            return Ok(true);
        }

        let delay = self.config.backoff.delay(retry_count as u32);
        let next_retry_at = self.clock.now_millis() + delay.as_millis() as i64;
        self.repository
            .schedule_retry(
                entry.local_seq,
                retry_count,
                next_retry_at,
                Some(reason.clone()),
                Some(err.code()),
            )
            .await?;
        warn!(
            "[Outbox] Send of {} failed (attempt {}), retrying in {}ms: {}",
            entry.entity_id,
            retry_count,
            delay.as_millis(),
            reason
        );
        let _ = self.events.send(OutboxEvent::Retrying {
            local_seq: entry.local_seq,
            entity_id: entry.entity_id,
            retry_count,
            next_retry_at,
            error_code: err.code(),
        });
        Ok(false)
    }

    /// Puts a claimed entry back, due at `due_at`, without spending a retry.
    async fn release(&self, entry: &OutboxEntry, err: &Error, due_at: i64) -> Result<()> {
        self.repository
            .schedule_retry(
                entry.local_seq,
                entry.retry_count,
                due_at,
                Some(err.to_string()),
                Some(err.code()),
            )
            .await
    }

    fn remember_ack(&self, local_seq: i64, ack: &MutationAck) {
        if let Ok(mut recent) = self.recent_acks.lock() {
            if recent.len() >= RECENT_ACK_CAPACITY {
                recent.pop_front();
            }
            recent.push_back((local_seq, ack.clone()));
        }
    }

    fn recent_ack(&self, local_seq: i64) -> Option<MutationAck> {
        let recent = self.recent_acks.lock().ok()?;
        recent
            .iter()
            .rev()
            .find(|(seq, _)| *seq == local_seq)
            .map(|(_, ack)| ack.clone())
    }

    async fn resolve_waiters(&self, local_seq: i64, outcome: Result<MutationAck>) {
        let Some(waiters) = self.waiters.lock().await.remove(&local_seq) else {
            return;
        };
        match outcome {
            Ok(ack) => {
                for waiter in waiters {
                    let _ = waiter.send(Ok(ack.clone()));
                }
            }
            Err(err) => {
                let message = err.to_string();
                let mut first = Some(err);
                for waiter in waiters {
                    let err = first
                        .take()
                        .unwrap_or_else(|| Error::Internal(message.clone()));
                    let _ = waiter.send(Err(err));
                }
            }
        }
    }
}

fn poisoned_error(entry: &OutboxEntry, reason: Option<String>) -> Error {
    Error::Poisoned {
        mutation_id: entry.mutation_id.clone(),
        attempts: entry.retry_count,
        reason: reason.unwrap_or_else(|| "rejected".to_string()),
    }
}
