use async_trait::async_trait;

use crate::errors::Result;
use crate::sync::{ApplyOutcome, ApplyReport, Collection, NewOutboxEntry, OutboxEntry, SyncRow};

use super::messaging_model::{
    Conversation, DeliveryStatus, Membership, Message, MessageQuery, ReadState, UnreadBoundary,
    UnreadCount,
};

/// Local store for messaging entities.
#[async_trait]
pub trait MessagingRepositoryTrait: Send + Sync {
    fn get(&self, collection: Collection, entity_id: &str) -> Result<Option<SyncRow>>;
    fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>>;
    fn get_message(&self, message_id: &str) -> Result<Option<Message>>;
    fn get_membership(&self, conversation_id: &str, actor_id: &str) -> Result<Option<Membership>>;

    /// Message projection. Tombstoned ids are never returned.
    fn query_messages(&self, query: &MessageQuery) -> Result<Vec<Message>>;

    /// Checksum of the `(id, updated_at)` keys of a collection.
    fn collection_checksum(&self, collection: Collection) -> Result<String>;

    fn delivery_status(&self, message_id: &str) -> Result<DeliveryStatus>;

    /// Idempotent upsert of one row with the same checks as remote ingestion.
    async fn upsert(&self, row: SyncRow) -> Result<ApplyOutcome>;

    /// Single ingestion path for remote rows: tombstone check, parent check,
    /// last-writer-wins upsert, in order, stopping at the first hard failure.
    async fn apply_remote_rows(&self, rows: Vec<SyncRow>) -> Result<ApplyReport>;

    /// Removes rows deleted remotely. Missing rows are ignored.
    async fn apply_remote_delete(&self, collection: Collection, entity_id: String) -> Result<bool>;

    /// Writes the optimistic message row and its outbox entry atomically.
    async fn insert_local_message(
        &self,
        message: Message,
        outbox: NewOutboxEntry,
    ) -> Result<OutboxEntry>;

    /// Deletes a message, records its tombstone and queues the remote delete
    /// in one transaction. Returns `None` when there was nothing to delete.
    async fn finalize_message_delete(
        &self,
        message_id: String,
        deleted_at: i64,
        outbox: NewOutboxEntry,
    ) -> Result<Option<OutboxEntry>>;
}

/// Per-(conversation, actor) read watermarks.
#[async_trait]
pub trait ReadStateRepositoryTrait: Send + Sync {
    fn get_read_state(&self, conversation_id: &str, actor_id: &str) -> Result<Option<ReadState>>;

    /// Returns the read state, creating it with `last_read_at = 0` if absent.
    /// `None` when the conversation itself is not stored.
    async fn ensure_read_state(
        &self,
        conversation_id: String,
        actor_id: String,
        now: i64,
    ) -> Result<Option<ReadState>>;

    /// Raises the watermark; never lowers it.
    async fn advance_watermark(
        &self,
        conversation_id: String,
        actor_id: String,
        last_read_at: i64,
        last_read_message_id: Option<String>,
        now: i64,
    ) -> Result<Option<ReadState>>;

    /// Raises the watermark and queues `receipt` in one transaction.
    ///
    /// The receipt is written only when the stored watermark is not already
    /// past `last_read_at`. `None` when the conversation is not stored.
    async fn mark_read(
        &self,
        conversation_id: String,
        actor_id: String,
        last_read_at: i64,
        last_read_message_id: Option<String>,
        receipt: NewOutboxEntry,
    ) -> Result<Option<(ReadState, Option<OutboxEntry>)>>;

    fn unread_boundary(
        &self,
        conversation_id: &str,
        actor_id: &str,
        last_read_at: i64,
    ) -> Result<UnreadBoundary>;

    fn unread_counts(&self, actor_id: &str) -> Result<Vec<UnreadCount>>;
}
