//! Two-phase deletion and tombstone bookkeeping.
//!
//! `request_delete` only hides the message. The delete becomes permanent
//! when the cancel window closes: row removal, tombstone and the outbound
//! delete mutation are then written in one transaction.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use log::{debug, info, warn};
use serde_json::json;
use tokio::task::JoinHandle;

use huddle_core::errors::{Error, Result};
use huddle_core::messaging::{Message, MessageQuery, MessagingRepositoryTrait};
use huddle_core::sync::{
    Clock, Collection, NewOutboxEntry, OutboxEntry, OutboxMutationKind, Tombstone,
    TombstoneRepositoryTrait,
};

use crate::config::TombstoneConfig;

/// Invoked after a delete has been finalized and queued for the backend.
pub type FinalizedListener = Arc<dyn Fn() + Send + Sync>;

struct PendingDelete {
    token: u64,
    conversation_id: String,
    actor_id: String,
    finalizing: bool,
    task: Option<JoinHandle<()>>,
}

pub struct TombstoneManager {
    tombstones: Arc<dyn TombstoneRepositoryTrait>,
    messaging: Arc<dyn MessagingRepositoryTrait>,
    clock: Arc<dyn Clock>,
    config: TombstoneConfig,
    pending: StdMutex<HashMap<String, PendingDelete>>,
    next_token: AtomicU64,
    on_finalized: RwLock<Option<FinalizedListener>>,
}

impl TombstoneManager {
    pub fn new(
        tombstones: Arc<dyn TombstoneRepositoryTrait>,
        messaging: Arc<dyn MessagingRepositoryTrait>,
        clock: Arc<dyn Clock>,
        config: TombstoneConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tombstones,
            messaging,
            clock,
            config,
            pending: StdMutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            on_finalized: RwLock::new(None),
        })
    }

    pub fn set_finalized_listener(&self, listener: FinalizedListener) {
        if let Ok(mut slot) = self.on_finalized.write() {
            *slot = Some(listener);
        }
    }

    fn pending_map(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, PendingDelete>>> {
        self.pending
            .lock()
            .map_err(|_| Error::Internal("pending delete table poisoned".to_string()))
    }

    /// Hides `message_id` now and deletes it for good once the cancel window
    /// closes. Requesting an already pending delete is a no-op.
    pub async fn request_delete(self: &Arc<Self>, message_id: &str, actor_id: &str) -> Result<()> {
        let message = self
            .messaging
            .get_message(message_id)?
            .ok_or_else(|| Error::NotFound(format!("Message {}", message_id)))?;

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        {
            let mut pending = self.pending_map()?;
            if pending.contains_key(message_id) {
                return Ok(());
            }
            pending.insert(
                message_id.to_string(),
                PendingDelete {
                    token,
                    conversation_id: message.conversation_id.clone(),
                    actor_id: actor_id.to_string(),
                    finalizing: false,
                    task: None,
                },
            );
        }

        let manager = Arc::clone(self);
        let id = message_id.to_string();
        let window = self.config.cancel_window();
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Err(err) = manager.finalize(&id, token).await {
                warn!("[Tombstone] Failed to finalize delete of {}: {}", id, err);
            }
        });

        let mut pending = self.pending_map()?;
        match pending.get_mut(message_id) {
            Some(entry) if entry.token == token => entry.task = Some(task),
            // Canceled or already finalized while spawning.
            _ => task.abort(),
        }
        debug!(
            "[Tombstone] Delete of {} pending for {}ms",
            message_id,
            window.as_millis()
        );
        Ok(())
    }

    /// Restores a message whose delete is still inside the cancel window.
    pub fn cancel_delete(&self, message_id: &str) -> Result<bool> {
        let mut pending = self.pending_map()?;
        match pending.get(message_id) {
            Some(entry) if !entry.finalizing => {
                if let Some(entry) = pending.remove(message_id) {
                    if let Some(task) = entry.task {
                        task.abort();
                    }
                }
                debug!("[Tombstone] Delete of {} canceled", message_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending
            .lock()
            .map(|pending| pending.contains_key(message_id))
            .unwrap_or(false)
    }

    async fn finalize(&self, message_id: &str, token: u64) -> Result<Option<OutboxEntry>> {
        let (conversation_id, actor_id) = {
            let mut pending = self.pending_map()?;
            match pending.get_mut(message_id) {
                Some(entry) if entry.token == token && !entry.finalizing => {
                    entry.finalizing = true;
                    (entry.conversation_id.clone(), entry.actor_id.clone())
                }
                _ => return Ok(None),
            }
        };

        let now = self.clock.now_millis();
        let request = NewOutboxEntry::new(
            OutboxMutationKind::DeleteMessage,
            conversation_id.clone(),
            actor_id,
            message_id.to_string(),
            json!({ "id": message_id, "conversation_id": conversation_id }),
            now,
        );
        let result = self
            .messaging
            .finalize_message_delete(message_id.to_string(), now, request)
            .await;

        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(message_id);
        }
        let queued = result?;

        match &queued {
            Some(entry) => {
                info!(
                    "[Tombstone] Deleted {} (outbox seq {})",
                    message_id, entry.local_seq
                );
                let listener = self.on_finalized.read().ok().and_then(|slot| slot.clone());
                if let Some(listener) = listener {
                    listener();
                }
            }
            None => debug!("[Tombstone] {} was already gone", message_id),
        }
        Ok(queued)
    }

    /// Finalizes every pending delete immediately.
    pub async fn flush(&self) -> Result<usize> {
        let due = {
            let pending = self.pending_map()?;
            pending
                .iter()
                .filter(|(_, entry)| !entry.finalizing)
                .map(|(id, entry)| (id.clone(), entry.token))
                .collect::<Vec<_>>()
        };

        let mut finalized = 0;
        for (id, token) in due {
            if let Some(task) = self
                .pending_map()?
                .get_mut(&id)
                .and_then(|entry| entry.task.take())
            {
                task.abort();
            }
            if self.finalize(&id, token).await?.is_some() {
                finalized += 1;
            }
        }
        Ok(finalized)
    }

    /// Records a tombstone without touching the row.
    pub async fn mark_deleted(&self, entity_id: &str, kind: Collection) -> Result<()> {
        self.tombstones
            .mark_deleted(Tombstone {
                entity_id: entity_id.to_string(),
                entity_kind: kind,
                deleted_at: self.clock.now_millis(),
            })
            .await
    }

    pub fn is_deleted(&self, entity_id: &str) -> Result<bool> {
        self.tombstones.is_deleted(entity_id)
    }

    /// Drops tombstoned messages. A delete still inside its cancel window
    /// has no tombstone yet, so its message is kept.
    pub fn filter_deleted(&self, messages: Vec<Message>) -> Result<Vec<Message>> {
        let ids = messages.iter().map(|m| m.id.clone()).collect::<Vec<_>>();
        let deleted = self.tombstones.deleted_among(&ids)?;
        Ok(messages
            .into_iter()
            .filter(|m| !deleted.contains(&m.id))
            .collect())
    }

    /// Message projection with pending deletes hidden.
    pub fn visible_messages(&self, query: &MessageQuery) -> Result<Vec<Message>> {
        let hidden = self.pending_ids()?;
        let messages = self.messaging.query_messages(query)?;
        Ok(messages
            .into_iter()
            .filter(|m| !hidden.contains(&m.id))
            .collect())
    }

    fn pending_ids(&self) -> Result<HashSet<String>> {
        Ok(self.pending_map()?.keys().cloned().collect())
    }

    /// Purges tombstones older than the retention period.
    pub async fn gc(&self) -> Result<usize> {
        let cutoff = self.clock.now_millis() - self.config.retention_ms as i64;
        let purged = self.tombstones.purge_before(cutoff).await?;
        if purged > 0 {
            info!("[Tombstone] Purged {} expired tombstone(s)", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{eventually, harness, message, Harness};
    use huddle_core::sync::{OutboxRepositoryTrait, OutboxStatus, SyncRow};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn manager(h: &Harness, cancel_window_ms: u64) -> Arc<TombstoneManager> {
        TombstoneManager::new(
            Arc::new(h.store.tombstones()),
            Arc::new(h.store.messaging()),
            h.clock.clone(),
            TombstoneConfig {
                cancel_window_ms,
                ..TombstoneConfig::default()
            },
        )
    }

    async fn seed(h: &Harness, ids: &[&str]) {
        let rows = ids
            .iter()
            .enumerate()
            .map(|(i, id)| SyncRow::Message(message(id, "c1", "u1", 100 + i as i64)))
            .collect();
        h.store
            .messaging()
            .apply_remote_rows(rows)
            .await
            .expect("seed");
    }

    #[tokio::test]
    async fn delete_is_hidden_during_the_window_then_permanent() {
        let h = harness(5_000).await;
        seed(&h, &["m1", "m2"]).await;
        let tombstones = manager(&h, 100);
        let finalized = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finalized);
        tombstones.set_finalized_listener(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tombstones.request_delete("m1", "u1").await.expect("request");
        assert!(tombstones.is_pending("m1"));
        assert!(!tombstones.is_deleted("m1").expect("is_deleted"));
        let visible = tombstones
            .visible_messages(&MessageQuery::conversation("c1"))
            .expect("visible");
        assert_eq!(
            visible.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m2"]
        );
        let stored = h.store.messaging().get_message("m1").expect("get").expect("m1");
        let kept = tombstones
            .filter_deleted(vec![stored.clone()])
            .expect("filter");
        assert_eq!(kept.len(), 1, "undo is still possible");

        assert!(eventually(Duration::from_secs(5), || !tombstones.is_pending("m1")).await);
        assert!(tombstones.is_deleted("m1").expect("is_deleted"));
        assert!(h.store.messaging().get_message("m1").expect("get").is_none());
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert!(tombstones.filter_deleted(vec![stored]).expect("filter").is_empty());

        let queued = h
            .store
            .outbox()
            .list_entries(Some(OutboxStatus::Pending))
            .expect("entries");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, OutboxMutationKind::DeleteMessage);
        assert_eq!(queued[0].entity_id, "m1");
    }

    #[tokio::test]
    async fn cancel_inside_the_window_restores_the_message() {
        let h = harness(5_000).await;
        seed(&h, &["m1"]).await;
        let tombstones = manager(&h, 100);

        tombstones.request_delete("m1", "u1").await.expect("request");
        assert!(tombstones.cancel_delete("m1").expect("cancel"));
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(!tombstones.is_deleted("m1").expect("is_deleted"));
        assert!(h.store.messaging().get_message("m1").expect("get").is_some());
        assert!(h.store.outbox().list_entries(None).expect("entries").is_empty());
        assert!(!tombstones.cancel_delete("m1").expect("second cancel"));
    }

    #[tokio::test]
    async fn flush_finalizes_without_waiting() {
        let h = harness(5_000).await;
        seed(&h, &["m1", "m2"]).await;
        let tombstones = manager(&h, 60_000);

        tombstones.request_delete("m1", "u1").await.expect("m1");
        tombstones.request_delete("m2", "u1").await.expect("m2");
        assert_eq!(tombstones.flush().await.expect("flush"), 2);
        assert!(tombstones.is_deleted("m1").expect("m1"));
        assert!(tombstones.is_deleted("m2").expect("m2"));
        assert!(!tombstones.is_pending("m1"));
    }

    #[tokio::test]
    async fn filter_and_gc() {
        let h = harness(5_000).await;
        seed(&h, &["m1", "m2", "m3"]).await;
        let tombstones = manager(&h, 60_000);
        tombstones
            .mark_deleted("m1", Collection::Messages)
            .await
            .expect("mark");
        tombstones.request_delete("m2", "u1").await.expect("m2");

        let all = h
            .store
            .messaging()
            .query_messages(&MessageQuery::default())
            .expect("query");
        let mut candidates = all.clone();
        candidates.push(message("m1", "c1", "u1", 1));
        let kept = tombstones.filter_deleted(candidates).expect("filter");
        let mut kept_ids = kept.iter().map(|m| m.id.as_str()).collect::<Vec<_>>();
        kept_ids.sort_unstable();
        assert_eq!(kept_ids, vec!["m2", "m3"]);
        assert!(tombstones.is_pending("m2"));

        h.clock.set(5_000 + TombstoneConfig::default().retention_ms as i64 + 1);
        assert_eq!(tombstones.gc().await.expect("gc"), 1);
        assert!(!tombstones.is_deleted("m1").expect("is_deleted"));
    }

    #[tokio::test]
    async fn unknown_message_cannot_be_deleted() {
        let h = harness(0).await;
        let tombstones = manager(&h, 10);
        assert!(matches!(
            tombstones.request_delete("ghost", "u1").await,
            Err(Error::NotFound(_))
        ));
    }
}
