//! Repository for conversations, users, memberships and messages.
//!
//! Every row from outside the device enters through [`apply_rows`], which
//! checks tombstones and parents before a last-writer-wins upsert.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use huddle_core::errors::{Error, Result};
use huddle_core::messaging::{
    Conversation, DeliveryStatus, Membership, Message, MessageQuery, MessagingRepositoryTrait,
};
use huddle_core::sync::{
    collection_checksum, should_apply_lww, ApplyFailure, ApplyOutcome, ApplyReport, Collection,
    NewOutboxEntry, OutboxEntry, OutboxStatus, RowResult, SyncRow, Tombstone,
};

use crate::db::{get_connection, savepoint, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::{conversations, memberships, messages, tombstones, users};
use crate::sync::{is_tombstoned, send_statuses_for, write_outbox_entry, write_tombstone};

use super::model::{ConversationDB, MembershipDB, MessageDB, UserDB};

pub(crate) fn conversation_exists(conn: &mut SqliteConnection, conversation_id: &str) -> Result<bool> {
    let found = conversations::table
        .find(conversation_id)
        .select(conversations::id)
        .first::<String>(conn)
        .optional()
        .map_err(StorageError::from)?;
    Ok(found.is_some())
}

fn split_membership_key(entity_id: &str) -> Result<(&str, &str)> {
    entity_id.split_once(':').ok_or_else(|| {
        Error::InvalidInput(format!("Malformed membership key '{}'", entity_id))
    })
}

fn load_membership(
    conn: &mut SqliteConnection,
    conversation_id: &str,
    actor_id: &str,
) -> Result<Option<MembershipDB>> {
    Ok(memberships::table
        .find((conversation_id, actor_id))
        .first::<MembershipDB>(conn)
        .optional()
        .map_err(StorageError::from)?)
}

fn upsert_conversation(conn: &mut SqliteConnection, incoming: Conversation) -> Result<ApplyOutcome> {
    let local = conversations::table
        .find(&incoming.id)
        .select(conversations::updated_at)
        .first::<i64>(conn)
        .optional()
        .map_err(StorageError::from)?;
    if let Some(local_updated_at) = local {
        if !should_apply_lww(local_updated_at, incoming.updated_at) {
            return Ok(ApplyOutcome::Stale);
        }
    }

    let row = ConversationDB::from(incoming);
    diesel::insert_into(conversations::table)
        .values(&row)
        .on_conflict(conversations::id)
        .do_update()
        .set(&row)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(ApplyOutcome::Applied)
}

fn upsert_user(conn: &mut SqliteConnection, incoming: huddle_core::messaging::User) -> Result<ApplyOutcome> {
    let local = users::table
        .find(&incoming.id)
        .select(users::updated_at)
        .first::<i64>(conn)
        .optional()
        .map_err(StorageError::from)?;
    if let Some(local_updated_at) = local {
        if !should_apply_lww(local_updated_at, incoming.updated_at) {
            return Ok(ApplyOutcome::Stale);
        }
    }

    let row = UserDB::from(incoming);
    diesel::insert_into(users::table)
        .values(&row)
        .on_conflict(users::id)
        .do_update()
        .set(&row)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(ApplyOutcome::Applied)
}

/// Fields follow last-writer-wins; the read watermark only ever moves up.
fn upsert_membership(conn: &mut SqliteConnection, incoming: Membership) -> Result<ApplyOutcome> {
    let Some(local) = load_membership(conn, &incoming.conversation_id, &incoming.actor_id)? else {
        diesel::insert_into(memberships::table)
            .values(MembershipDB::from(incoming))
            .execute(conn)
            .map_err(StorageError::from)?;
        return Ok(ApplyOutcome::Applied);
    };

    let fields_win = should_apply_lww(local.updated_at, incoming.updated_at);
    let watermark_rises = incoming.last_read_at > local.last_read_at;
    if !fields_win && !watermark_rises {
        return Ok(ApplyOutcome::Stale);
    }

    let mut merged = if fields_win {
        MembershipDB::from(incoming.clone())
    } else {
        local.clone()
    };
    if watermark_rises {
        merged.last_read_at = incoming.last_read_at;
        merged.last_read_message_id = incoming.last_read_message_id;
    } else {
        merged.last_read_at = local.last_read_at;
        merged.last_read_message_id = local.last_read_message_id;
    }

    diesel::update(memberships::table.find((&merged.conversation_id, &merged.actor_id)))
        .set(&merged)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(ApplyOutcome::Applied)
}

fn upsert_message(conn: &mut SqliteConnection, incoming: Message) -> Result<ApplyOutcome> {
    let local = messages::table
        .find(&incoming.id)
        .select(messages::updated_at)
        .first::<i64>(conn)
        .optional()
        .map_err(StorageError::from)?;
    if let Some(local_updated_at) = local {
        if !should_apply_lww(local_updated_at, incoming.updated_at) {
            return Ok(ApplyOutcome::Stale);
        }
    }

    let row = MessageDB::from_domain(incoming)?;
    diesel::insert_into(messages::table)
        .values(&row)
        .on_conflict(messages::id)
        .do_update()
        .set(&row)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(ApplyOutcome::Applied)
}

/// Tombstone check, parent check, then upsert. Ordering problems are an
/// outcome, not an error.
pub(crate) fn apply_row(conn: &mut SqliteConnection, row: SyncRow) -> Result<ApplyOutcome> {
    let entity_id = row.entity_id();
    if is_tombstoned(conn, &entity_id)? {
        log::debug!("[Store] Ignoring tombstoned {} {}", row.collection(), entity_id);
        return Ok(ApplyOutcome::Tombstoned);
    }

    if let Some((parent, parent_id)) = row.parent() {
        if !conversation_exists(conn, parent_id)? {
            log::warn!(
                "[Store] Skipping {} {}: parent {} {} is not stored yet",
                row.collection(),
                entity_id,
                parent,
                parent_id
            );
            return Ok(ApplyOutcome::Orphaned {
                parent,
                parent_id: parent_id.to_string(),
            });
        }
    }

    match row {
        SyncRow::Conversation(conversation) => upsert_conversation(conn, conversation),
        SyncRow::User(user) => upsert_user(conn, user),
        SyncRow::Membership(membership) => upsert_membership(conn, membership),
        SyncRow::Message(message) => upsert_message(conn, message),
    }
}

/// Applies `rows` in the given order, each in its own savepoint, and stops at
/// the first hard failure. Everything before the failure stays applied.
pub fn apply_rows(conn: &mut SqliteConnection, rows: Vec<SyncRow>) -> ApplyReport {
    let mut report = ApplyReport::default();
    for row in rows {
        let collection = row.collection();
        let entity_id = row.entity_id();
        let updated_at = row.updated_at();
        match savepoint(conn, |conn| apply_row(conn, row)) {
            Ok(outcome) => report.results.push(RowResult {
                collection,
                entity_id,
                updated_at,
                outcome,
            }),
            Err(err) => {
                log::error!(
                    "[Store] Failed to apply {} {}: {}",
                    collection,
                    entity_id,
                    err
                );
                report.failure = Some(ApplyFailure {
                    entity_id,
                    updated_at,
                    error: err.to_string(),
                });
                break;
            }
        }
    }
    report
}

fn delete_row(conn: &mut SqliteConnection, collection: Collection, entity_id: &str) -> Result<bool> {
    let deleted = match collection {
        Collection::Conversations => diesel::delete(conversations::table.find(entity_id))
            .execute(conn)
            .map_err(StorageError::from)?,
        Collection::Users => diesel::delete(users::table.find(entity_id))
            .execute(conn)
            .map_err(StorageError::from)?,
        Collection::Memberships => {
            let (conversation_id, actor_id) = split_membership_key(entity_id)?;
            diesel::delete(memberships::table.find((conversation_id, actor_id)))
                .execute(conn)
                .map_err(StorageError::from)?
        }
        Collection::Messages => diesel::delete(messages::table.find(entity_id))
            .execute(conn)
            .map_err(StorageError::from)?,
    };
    Ok(deleted > 0)
}

pub struct MessagingRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl MessagingRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        MessagingRepository { pool, writer }
    }

    fn load_keys(&self, collection: Collection) -> Result<Vec<(String, i64)>> {
        let mut conn = get_connection(&self.pool)?;
        let keys = match collection {
            Collection::Conversations => conversations::table
                .select((conversations::id, conversations::updated_at))
                .load::<(String, i64)>(&mut conn),
            Collection::Users => users::table
                .select((users::id, users::updated_at))
                .load::<(String, i64)>(&mut conn),
            Collection::Messages => messages::table
                .select((messages::id, messages::updated_at))
                .load::<(String, i64)>(&mut conn),
            Collection::Memberships => memberships::table
                .select((
                    memberships::conversation_id,
                    memberships::actor_id,
                    memberships::updated_at,
                ))
                .load::<(String, String, i64)>(&mut conn)
                .map(|rows| {
                    rows.into_iter()
                        .map(|(conversation_id, actor_id, updated_at)| {
                            (format!("{}:{}", conversation_id, actor_id), updated_at)
                        })
                        .collect()
                }),
        }
        .map_err(StorageError::from)?;
        Ok(keys)
    }
}

#[async_trait]
impl MessagingRepositoryTrait for MessagingRepository {
    fn get(&self, collection: Collection, entity_id: &str) -> Result<Option<SyncRow>> {
        let row = match collection {
            Collection::Conversations => self.get_conversation(entity_id)?.map(SyncRow::Conversation),
            Collection::Users => {
                let mut conn = get_connection(&self.pool)?;
                users::table
                    .find(entity_id)
                    .first::<UserDB>(&mut conn)
                    .optional()
                    .map_err(StorageError::from)?
                    .map(|user| SyncRow::User(user.into()))
            }
            Collection::Memberships => {
                let (conversation_id, actor_id) = split_membership_key(entity_id)?;
                self.get_membership(conversation_id, actor_id)?
                    .map(SyncRow::Membership)
            }
            Collection::Messages => self.get_message(entity_id)?.map(SyncRow::Message),
        };
        Ok(row)
    }

    fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let mut conn = get_connection(&self.pool)?;
        Ok(conversations::table
            .find(conversation_id)
            .first::<ConversationDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .map(Conversation::from))
    }

    fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        let mut conn = get_connection(&self.pool)?;
        Ok(messages::table
            .find(message_id)
            .first::<MessageDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .map(Message::from))
    }

    fn get_membership(&self, conversation_id: &str, actor_id: &str) -> Result<Option<Membership>> {
        let mut conn = get_connection(&self.pool)?;
        Ok(load_membership(&mut conn, conversation_id, actor_id)?.map(Membership::from))
    }

    fn query_messages(&self, query: &MessageQuery) -> Result<Vec<Message>> {
        let mut conn = get_connection(&self.pool)?;
        let mut statement = messages::table
            .filter(messages::id.ne_all(tombstones::table.select(tombstones::entity_id)))
            .into_boxed();

        if let Some(conversation_id) = &query.conversation_id {
            statement = statement.filter(messages::conversation_id.eq(conversation_id.clone()));
        }
        if let Some(actor_id) = &query.actor_id {
            statement = statement.filter(messages::actor_id.eq(actor_id.clone()));
        }
        if let Some(after) = query.created_after {
            statement = statement.filter(messages::created_at.gt(after));
        }
        if let Some(until) = query.created_until {
            statement = statement.filter(messages::created_at.le(until));
        }
        if let Some(parent_id) = &query.parent_id {
            statement = statement.filter(messages::parent_id.eq(parent_id.clone()));
        }
        statement = if query.descending {
            statement.order((messages::created_at.desc(), messages::id.desc()))
        } else {
            statement.order((messages::created_at.asc(), messages::id.asc()))
        };
        if let Some(limit) = query.limit {
            statement = statement.limit(limit);
        }

        Ok(statement
            .load::<MessageDB>(&mut conn)
            .map_err(StorageError::from)?
            .into_iter()
            .map(Message::from)
            .collect())
    }

    fn collection_checksum(&self, collection: Collection) -> Result<String> {
        Ok(collection_checksum(self.load_keys(collection)?))
    }

    fn delivery_status(&self, message_id: &str) -> Result<DeliveryStatus> {
        let mut conn = get_connection(&self.pool)?;
        let statuses = send_statuses_for(&mut conn, message_id)?;
        if statuses
            .iter()
            .any(|status| matches!(status, OutboxStatus::Pending | OutboxStatus::InFlight))
        {
            return Ok(DeliveryStatus::Pending);
        }
        if statuses.contains(&OutboxStatus::Dead) {
            return Ok(DeliveryStatus::Failed);
        }
        Ok(DeliveryStatus::Sent)
    }

    async fn upsert(&self, row: SyncRow) -> Result<ApplyOutcome> {
        let entity_id = row.entity_id();
        let mut report = self.apply_remote_rows(vec![row]).await?;
        if let Some(failure) = report.failure {
            return Err(Error::Internal(failure.error));
        }
        report
            .results
            .pop()
            .map(|result| result.outcome)
            .ok_or_else(|| Error::Internal(format!("No outcome recorded for {}", entity_id)))
    }

    async fn apply_remote_rows(&self, rows: Vec<SyncRow>) -> Result<ApplyReport> {
        if rows.is_empty() {
            return Ok(ApplyReport::default());
        }
        self.writer.exec(move |conn| Ok(apply_rows(conn, rows))).await
    }

    async fn apply_remote_delete(&self, collection: Collection, entity_id: String) -> Result<bool> {
        self.writer
            .exec(move |conn| {
                let deleted = delete_row(conn, collection, &entity_id)?;
                if collection == Collection::Messages {
                    write_tombstone(
                        conn,
                        &Tombstone {
                            entity_id: entity_id.clone(),
                            entity_kind: collection,
                            deleted_at: Utc::now().timestamp_millis(),
                        },
                    )?;
                }
                Ok(deleted)
            })
            .await
    }

    async fn insert_local_message(
        &self,
        message: Message,
        outbox: NewOutboxEntry,
    ) -> Result<OutboxEntry> {
        self.writer
            .exec(move |conn| {
                if !conversation_exists(conn, &message.conversation_id)? {
                    return Err(Error::MissingParent {
                        entity: "message".to_string(),
                        entity_id: message.id.clone(),
                        parent_kind: Collection::Conversations.to_string(),
                        parent_id: message.conversation_id.clone(),
                    });
                }
                let row = MessageDB::from_domain(message)?;
                diesel::insert_into(messages::table)
                    .values(&row)
                    .on_conflict(messages::id)
                    .do_update()
                    .set(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                write_outbox_entry(conn, outbox)
            })
            .await
    }

    async fn finalize_message_delete(
        &self,
        message_id: String,
        deleted_at: i64,
        outbox: NewOutboxEntry,
    ) -> Result<Option<OutboxEntry>> {
        self.writer
            .exec(move |conn| {
                let existed = delete_row(conn, Collection::Messages, &message_id)?;
                write_tombstone(
                    conn,
                    &Tombstone {
                        entity_id: message_id.clone(),
                        entity_kind: Collection::Messages,
                        deleted_at,
                    },
                )?;
                if !existed {
                    return Ok(None);
                }
                write_outbox_entry(conn, outbox).map(Some)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{conversation, membership, message, seed_conversation, setup_store};
    use huddle_core::sync::{OutboxMutationKind, OutboxRepositoryTrait, TombstoneRepositoryTrait};
    use serde_json::json;

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = setup_store();
        let repo = store.messaging();
        seed_conversation(&store, "c1").await;

        let row = SyncRow::Message(message("m1", "c1", "u1", 100));
        assert_eq!(repo.upsert(row.clone()).await.expect("first"), ApplyOutcome::Applied);
        assert_eq!(repo.upsert(row.clone()).await.expect("second"), ApplyOutcome::Applied);

        let all = repo
            .query_messages(&MessageQuery::conversation("c1"))
            .expect("query");
        assert_eq!(all.len(), 1);
        assert_eq!(repo.get(Collection::Messages, "m1").expect("get"), Some(row));
    }

    #[tokio::test]
    async fn older_rows_do_not_overwrite_newer_ones() {
        let store = setup_store();
        let repo = store.messaging();
        seed_conversation(&store, "c1").await;

        let mut newer = message("m1", "c1", "u1", 100);
        newer.updated_at = 500;
        newer.content = "edited".to_string();
        repo.upsert(SyncRow::Message(newer)).await.expect("newer");

        let older = message("m1", "c1", "u1", 100);
        assert_eq!(
            repo.upsert(SyncRow::Message(older)).await.expect("older"),
            ApplyOutcome::Stale
        );
        assert_eq!(
            repo.get_message("m1").expect("get").expect("exists").content,
            "edited"
        );
    }

    #[tokio::test]
    async fn child_without_parent_is_skipped_not_failed() {
        let store = setup_store();
        let repo = store.messaging();

        let report = repo
            .apply_remote_rows(vec![
                SyncRow::Membership(membership("ghost", "u1", 10)),
                SyncRow::Message(message("m1", "ghost", "u1", 10)),
            ])
            .await
            .expect("apply");

        assert!(report.is_complete());
        assert_eq!(report.applied_count(), 0);
        assert_eq!(
            report.outcome_for("m1"),
            Some(&ApplyOutcome::Orphaned {
                parent: Collection::Conversations,
                parent_id: "ghost".to_string()
            })
        );
        assert!(repo.get_message("m1").expect("get").is_none());
        assert!(repo.get_membership("ghost", "u1").expect("get").is_none());
    }

    #[tokio::test]
    async fn tombstoned_rows_are_not_reinserted() {
        let store = setup_store();
        let repo = store.messaging();
        seed_conversation(&store, "c1").await;
        store
            .tombstones()
            .mark_deleted(Tombstone {
                entity_id: "m1".to_string(),
                entity_kind: Collection::Messages,
                deleted_at: 10,
            })
            .await
            .expect("tombstone");

        let report = repo
            .apply_remote_rows(vec![
                SyncRow::Message(message("m1", "c1", "u1", 10)),
                SyncRow::Message(message("m2", "c1", "u1", 11)),
            ])
            .await
            .expect("apply");

        assert_eq!(report.outcome_for("m1"), Some(&ApplyOutcome::Tombstoned));
        assert_eq!(report.outcome_for("m2"), Some(&ApplyOutcome::Applied));
        assert!(repo.get_message("m1").expect("get").is_none());
    }

    #[tokio::test]
    async fn parent_and_child_in_one_batch_apply_in_order() {
        let store = setup_store();
        let repo = store.messaging();

        let report = repo
            .apply_remote_rows(vec![
                SyncRow::Conversation(conversation("c9", 5)),
                SyncRow::Membership(membership("c9", "u1", 6)),
                SyncRow::Message(message("m9", "c9", "u2", 7)),
            ])
            .await
            .expect("apply");
        assert_eq!(report.applied_count(), 3);
    }

    #[tokio::test]
    async fn membership_watermark_never_moves_back() {
        let store = setup_store();
        let repo = store.messaging();
        seed_conversation(&store, "c1").await;

        let mut read = membership("c1", "u1", 10);
        read.last_read_at = 900;
        read.last_read_message_id = Some("m9".to_string());
        repo.upsert(SyncRow::Membership(read)).await.expect("read");

        let mut newer_fields = membership("c1", "u1", 20);
        newer_fields.last_read_at = 100;
        repo.upsert(SyncRow::Membership(newer_fields))
            .await
            .expect("newer");

        let stored = repo.get_membership("c1", "u1").expect("get").expect("exists");
        assert_eq!(stored.updated_at, 20);
        assert_eq!(stored.last_read_at, 900);
        assert_eq!(stored.last_read_message_id.as_deref(), Some("m9"));
    }

    #[tokio::test]
    async fn local_send_writes_message_and_outbox_atomically() {
        let store = setup_store();
        let repo = store.messaging();
        seed_conversation(&store, "c1").await;

        let entry = repo
            .insert_local_message(
                message("m1", "c1", "u1", 100),
                NewOutboxEntry::new(
                    OutboxMutationKind::SendMessage,
                    "c1",
                    "u1",
                    "m1",
                    json!({ "id": "m1" }),
                    100,
                ),
            )
            .await
            .expect("send");

        assert_eq!(entry.entity_id, "m1");
        assert_eq!(repo.delivery_status("m1").expect("status"), DeliveryStatus::Pending);

        store
            .outbox()
            .mark_dead(entry.local_seq, 6, None, None)
            .await
            .expect("dead");
        assert_eq!(repo.delivery_status("m1").expect("status"), DeliveryStatus::Failed);

        store.outbox().complete(entry.local_seq).await.expect("done");
        assert_eq!(repo.delivery_status("m1").expect("status"), DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn local_send_to_unknown_conversation_fails_without_side_effects() {
        let store = setup_store();
        let repo = store.messaging();

        let result = repo
            .insert_local_message(
                message("m1", "nowhere", "u1", 100),
                NewOutboxEntry::new(
                    OutboxMutationKind::SendMessage,
                    "nowhere",
                    "u1",
                    "m1",
                    json!({}),
                    100,
                ),
            )
            .await;

        assert!(matches!(result, Err(Error::MissingParent { .. })));
        assert!(store.outbox().list_entries(None).expect("list").is_empty());
    }

    #[tokio::test]
    async fn finalize_delete_removes_row_and_tombstones_it() {
        let store = setup_store();
        let repo = store.messaging();
        seed_conversation(&store, "c1").await;
        repo.upsert(SyncRow::Message(message("m1", "c1", "u1", 10)))
            .await
            .expect("insert");

        let entry = repo
            .finalize_message_delete(
                "m1".to_string(),
                50,
                NewOutboxEntry::new(
                    OutboxMutationKind::DeleteMessage,
                    "c1",
                    "u1",
                    "m1",
                    json!({ "id": "m1" }),
                    50,
                ),
            )
            .await
            .expect("delete");

        assert!(entry.is_some());
        assert!(repo.get_message("m1").expect("get").is_none());
        assert!(store.tombstones().is_deleted("m1").expect("check"));

        let again = repo
            .finalize_message_delete(
                "m1".to_string(),
                60,
                NewOutboxEntry::new(
                    OutboxMutationKind::DeleteMessage,
                    "c1",
                    "u1",
                    "m1",
                    json!({ "id": "m1" }),
                    60,
                ),
            )
            .await
            .expect("delete again");
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn remote_message_delete_blocks_late_insert() {
        let store = setup_store();
        let repo = store.messaging();
        seed_conversation(&store, "c1").await;

        assert!(!repo
            .apply_remote_delete(Collection::Messages, "m1".to_string())
            .await
            .expect("delete"));
        assert_eq!(
            repo.upsert(SyncRow::Message(message("m1", "c1", "u1", 10)))
                .await
                .expect("late insert"),
            ApplyOutcome::Tombstoned
        );
    }

    #[tokio::test]
    async fn query_filters_by_time_window_and_order() {
        let store = setup_store();
        let repo = store.messaging();
        seed_conversation(&store, "c1").await;
        for (id, at) in [("a", 10), ("b", 20), ("c", 30)] {
            repo.upsert(SyncRow::Message(message(id, "c1", "u1", at)))
                .await
                .expect("insert");
        }

        let window = repo
            .query_messages(&MessageQuery {
                conversation_id: Some("c1".to_string()),
                created_after: Some(10),
                created_until: Some(30),
                descending: true,
                limit: Some(5),
                ..Default::default()
            })
            .expect("query");
        let ids = window.iter().map(|m| m.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn checksum_changes_when_collection_changes() {
        let store = setup_store();
        let repo = store.messaging();
        seed_conversation(&store, "c1").await;

        let before = repo.collection_checksum(Collection::Messages).expect("sum");
        assert_eq!(
            before,
            repo.collection_checksum(Collection::Messages).expect("sum")
        );
        repo.upsert(SyncRow::Message(message("m1", "c1", "u1", 10)))
            .await
            .expect("insert");
        assert_ne!(
            before,
            repo.collection_checksum(Collection::Messages).expect("sum")
        );
    }
}
