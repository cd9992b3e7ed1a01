//! Read watermarks and unread boundaries, computed from the local store only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use log::debug;
use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard};

use huddle_core::errors::{Error, Result};
use huddle_core::messaging::{
    MessagingRepositoryTrait, ReadState, ReadStateRepositoryTrait, UnreadBoundary, UnreadCount,
};
use huddle_core::sync::{Clock, NewOutboxEntry, OutboxEntry, OutboxMutationKind};

/// Outcome of [`ReadTracker::mark_read`].
#[derive(Debug, Clone, PartialEq)]
pub struct MarkReadResult {
    pub state: ReadState,
    /// The queued receipt, or `None` when the watermark was already past
    /// the message.
    pub receipt: Option<OutboxEntry>,
}

/// Per-key serialization guard. Releasing it prunes the key from the table.
struct KeyGuard<'a> {
    tracker: &'a ReadTracker,
    key: (String, String),
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // The owned guard keeps one Arc alive; let go of it before counting.
        self.guard.take();
        self.tracker.release_key(&self.key);
    }
}

pub struct ReadTracker {
    read_state: Arc<dyn ReadStateRepositoryTrait>,
    messaging: Arc<dyn MessagingRepositoryTrait>,
    clock: Arc<dyn Clock>,
    locks: StdMutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl ReadTracker {
    pub fn new(
        read_state: Arc<dyn ReadStateRepositoryTrait>,
        messaging: Arc<dyn MessagingRepositoryTrait>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            read_state,
            messaging,
            clock,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, conversation_id: &str, actor_id: &str) -> Result<KeyGuard<'_>> {
        let key = (conversation_id.to_string(), actor_id.to_string());
        let lock = {
            let mut locks = self.lock_table()?;
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        Ok(KeyGuard {
            tracker: self,
            key,
            guard: Some(guard),
        })
    }

    fn lock_table(&self) -> Result<MutexGuard<'_, HashMap<(String, String), Arc<Mutex<()>>>>> {
        self.locks
            .lock()
            .map_err(|_| Error::Internal("read tracker lock table poisoned".to_string()))
    }

    /// Drops the entry for `key` once no caller holds or waits on it.
    fn release_key(&self, key: &(String, String)) {
        let Ok(mut locks) = self.lock_table() else {
            return;
        };
        if locks
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or_default()
    }

    /// First unread message and unread count for `actor_id`.
    ///
    /// A conversation opened for the first time gets a read-state row with a
    /// zero watermark and reports no unread separator.
    pub async fn compute_unread_boundary(
        &self,
        conversation_id: &str,
        actor_id: &str,
    ) -> Result<UnreadBoundary> {
        let _guard = self.lock_for(conversation_id, actor_id).await?;

        let state = match self.read_state.get_read_state(conversation_id, actor_id)? {
            Some(state) => state,
            None => {
                let created = self
                    .read_state
                    .ensure_read_state(
                        conversation_id.to_string(),
                        actor_id.to_string(),
                        self.clock.now_millis(),
                    )
                    .await?;
                if created.is_none() {
                    debug!(
                        "[ReadTracker] Conversation {} is not stored yet; no boundary",
                        conversation_id
                    );
                }
                return Ok(UnreadBoundary::default());
            }
        };

        self.read_state
            .unread_boundary(conversation_id, actor_id, state.last_read_at)
    }

    /// Raises the watermark to `through_message_id` and queues the receipt.
    pub async fn mark_read(
        &self,
        conversation_id: &str,
        actor_id: &str,
        through_message_id: &str,
    ) -> Result<MarkReadResult> {
        let _guard = self.lock_for(conversation_id, actor_id).await?;

        let message = self
            .messaging
            .get_message(through_message_id)?
            .ok_or_else(|| Error::NotFound(format!("Message {}", through_message_id)))?;
        if message.conversation_id != conversation_id {
            return Err(Error::InvalidInput(format!(
                "Message {} belongs to conversation {}, not {}",
                message.id, message.conversation_id, conversation_id
            )));
        }

        let now = self.clock.now_millis();
        let receipt = NewOutboxEntry::new(
            OutboxMutationKind::MarkRead,
            conversation_id,
            actor_id,
            message.id.clone(),
            json!({
                "conversation_id": conversation_id,
                "actor_id": actor_id,
                "last_read_at": message.created_at,
                "last_read_message_id": message.id,
            }),
            now,
        );
        let (state, receipt) = self
            .read_state
            .mark_read(
                conversation_id.to_string(),
                actor_id.to_string(),
                message.created_at,
                Some(message.id.clone()),
                receipt,
            )
            .await?
            .ok_or_else(|| Error::NotFound(format!("Conversation {}", conversation_id)))?;

        match &receipt {
            Some(_) => debug!(
                "[ReadTracker] {} read {} through {}",
                actor_id, conversation_id, message.id
            ),
            None => debug!(
                "[ReadTracker] Watermark for {} already past {}",
                conversation_id, message.id
            ),
        }
        Ok(MarkReadResult { state, receipt })
    }

    /// Applies a mark that was pending when the view opened, then computes
    /// the boundary.
    pub async fn open_conversation(
        &self,
        conversation_id: &str,
        actor_id: &str,
        pending_mark: Option<&str>,
    ) -> Result<UnreadBoundary> {
        if let Some(message_id) = pending_mark {
            self.mark_read(conversation_id, actor_id, message_id).await?;
        }
        self.compute_unread_boundary(conversation_id, actor_id).await
    }

    pub fn unread_counts(&self, actor_id: &str) -> Result<Vec<UnreadCount>> {
        self.read_state.unread_counts(actor_id)
    }
}
