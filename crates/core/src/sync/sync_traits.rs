use std::collections::HashSet;

use async_trait::async_trait;

use crate::errors::Result;

use super::sync_model::{
    Collection, NewOutboxEntry, OutboxEntry, OutboxStatus, SyncCursor, Tombstone,
};

/// Durable queue of outgoing mutations.
#[async_trait]
pub trait OutboxRepositoryTrait: Send + Sync {
    /// Appends an entry due immediately and returns it with its `local_seq`.
    async fn enqueue(&self, entry: NewOutboxEntry) -> Result<OutboxEntry>;

    /// Moves up to `limit` pending entries due at `now` to in-flight, ordered
    /// by `next_retry_at` then `local_seq`.
    async fn claim_due(&self, now: i64, limit: i64) -> Result<Vec<OutboxEntry>>;

    /// Deletes a delivered entry.
    async fn complete(&self, local_seq: i64) -> Result<()>;

    async fn schedule_retry(
        &self,
        local_seq: i64,
        retry_count: i32,
        next_retry_at: i64,
        last_error: Option<String>,
        last_error_code: Option<String>,
    ) -> Result<()>;

    /// Evicts a poisoned entry from the queue.
    async fn mark_dead(
        &self,
        local_seq: i64,
        retry_count: i32,
        last_error: Option<String>,
        last_error_code: Option<String>,
    ) -> Result<()>;

    /// Returns entries left in-flight by a killed process to pending.
    async fn recover_in_flight(&self) -> Result<usize>;

    /// Puts a dead entry back in the queue with a fresh retry budget.
    async fn requeue_dead(&self, local_seq: i64, now: i64) -> Result<bool>;

    async fn discard(&self, local_seq: i64) -> Result<bool>;

    fn get_entry(&self, local_seq: i64) -> Result<Option<OutboxEntry>>;

    fn list_entries(&self, status: Option<OutboxStatus>) -> Result<Vec<OutboxEntry>>;

    /// Earliest `next_retry_at` among pending entries.
    fn next_due_at(&self) -> Result<Option<i64>>;
}

#[async_trait]
pub trait TombstoneRepositoryTrait: Send + Sync {
    async fn mark_deleted(&self, tombstone: Tombstone) -> Result<()>;
    fn is_deleted(&self, entity_id: &str) -> Result<bool>;
    /// Subset of `entity_ids` that carry a tombstone.
    fn deleted_among(&self, entity_ids: &[String]) -> Result<HashSet<String>>;
    fn list_tombstones(&self) -> Result<Vec<Tombstone>>;
    /// Drops tombstones with `deleted_at` before `cutoff`.
    async fn purge_before(&self, cutoff: i64) -> Result<usize>;
}

#[async_trait]
pub trait SyncCursorRepositoryTrait: Send + Sync {
    /// Stored cursor, or the zero cursor for a collection never synced.
    fn get_cursor(&self, collection: Collection) -> Result<SyncCursor>;
    async fn save_cursor(&self, cursor: SyncCursor) -> Result<()>;
}
