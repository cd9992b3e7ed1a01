//! Repository for the outgoing mutation queue.

use std::sync::Arc;

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use uuid::Uuid;

use huddle_core::errors::Result;
use huddle_core::sync::{
    NewOutboxEntry, OutboxEntry, OutboxMutationKind, OutboxRepositoryTrait, OutboxStatus,
};

use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::{messages, outbox};
use crate::utils::{enum_from_db, enum_to_db};

use super::model::{NewOutboxEntryDB, OutboxEntryDB};

fn to_outbox_entry(row: OutboxEntryDB) -> Result<OutboxEntry> {
    Ok(OutboxEntry {
        local_seq: row.local_seq,
        mutation_id: row.mutation_id,
        kind: enum_from_db(&row.kind)?,
        conversation_id: row.conversation_id,
        actor_id: row.actor_id,
        entity_id: row.entity_id,
        payload: serde_json::from_str(&row.payload)?,
        status: enum_from_db(&row.status)?,
        retry_count: row.retry_count,
        next_retry_at: row.next_retry_at,
        last_error: row.last_error,
        last_error_code: row.last_error_code,
        created_at: row.created_at,
    })
}

/// Appends an outbox entry on `conn`. Call it inside the same transaction as
/// the optimistic local write so both land or neither does.
///
/// A newer read receipt supersedes any pending one for the same
/// (conversation, actor).
pub fn write_outbox_entry(conn: &mut SqliteConnection, entry: NewOutboxEntry) -> Result<OutboxEntry> {
    let kind = enum_to_db(&entry.kind)?;
    let pending = enum_to_db(&OutboxStatus::Pending)?;

    if entry.kind == OutboxMutationKind::MarkRead {
        let superseded = diesel::delete(
            outbox::table
                .filter(outbox::kind.eq(&kind))
                .filter(outbox::status.eq(&pending))
                .filter(outbox::conversation_id.eq(&entry.conversation_id))
                .filter(outbox::actor_id.eq(&entry.actor_id)),
        )
        .execute(conn)
        .map_err(StorageError::from)?;
        if superseded > 0 {
            log::debug!(
                "[Outbox] Superseded {} pending read receipt(s) for {}",
                superseded,
                entry.conversation_id
            );
        }
    }

    let row = NewOutboxEntryDB {
        mutation_id: entry
            .mutation_id
            .unwrap_or_else(|| Uuid::now_v7().to_string()),
        kind,
        conversation_id: entry.conversation_id,
        actor_id: entry.actor_id,
        entity_id: entry.entity_id,
        payload: serde_json::to_string(&entry.payload)?,
        status: pending,
        retry_count: 0,
        next_retry_at: entry.created_at,
        created_at: entry.created_at,
    };

    let inserted = diesel::insert_into(outbox::table)
        .values(&row)
        .returning(OutboxEntryDB::as_returning())
        .get_result(conn)
        .map_err(StorageError::from)?;

    to_outbox_entry(inserted)
}

/// Outbox statuses of entries that send the given message.
pub(crate) fn send_statuses_for(
    conn: &mut SqliteConnection,
    message_id: &str,
) -> Result<Vec<OutboxStatus>> {
    let kind = enum_to_db(&OutboxMutationKind::SendMessage)?;
    outbox::table
        .filter(outbox::kind.eq(kind))
        .filter(outbox::entity_id.eq(message_id))
        .select(outbox::status)
        .load::<String>(conn)
        .map_err(StorageError::from)?
        .iter()
        .map(|status| enum_from_db(status))
        .collect()
}

pub struct OutboxRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl OutboxRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }
}

#[async_trait]
impl OutboxRepositoryTrait for OutboxRepository {
    async fn enqueue(&self, entry: NewOutboxEntry) -> Result<OutboxEntry> {
        self.writer
            .exec(move |conn| write_outbox_entry(conn, entry))
            .await
    }

    async fn claim_due(&self, now: i64, limit: i64) -> Result<Vec<OutboxEntry>> {
        self.writer
            .exec(move |conn| {
                let pending = enum_to_db(&OutboxStatus::Pending)?;
                let in_flight = enum_to_db(&OutboxStatus::InFlight)?;

                let rows = outbox::table
                    .filter(outbox::status.eq(&pending))
                    .filter(outbox::next_retry_at.le(now))
                    .order((outbox::next_retry_at.asc(), outbox::local_seq.asc()))
                    .limit(limit)
                    .load::<OutboxEntryDB>(conn)
                    .map_err(StorageError::from)?;
                if rows.is_empty() {
                    return Ok(Vec::new());
                }

                let seqs = rows.iter().map(|row| row.local_seq).collect::<Vec<_>>();
                diesel::update(outbox::table.filter(outbox::local_seq.eq_any(&seqs)))
                    .set(outbox::status.eq(&in_flight))
                    .execute(conn)
                    .map_err(StorageError::from)?;

                rows.into_iter()
                    .map(|mut row| {
                        row.status = in_flight.clone();
                        to_outbox_entry(row)
                    })
                    .collect()
            })
            .await
    }

    async fn complete(&self, local_seq: i64) -> Result<()> {
        self.writer
            .exec(move |conn| {
                diesel::delete(outbox::table.find(local_seq))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    async fn schedule_retry(
        &self,
        local_seq: i64,
        retry_count: i32,
        next_retry_at: i64,
        last_error: Option<String>,
        last_error_code: Option<String>,
    ) -> Result<()> {
        self.writer
            .exec(move |conn| {
                diesel::update(outbox::table.find(local_seq))
                    .set((
                        outbox::status.eq(enum_to_db(&OutboxStatus::Pending)?),
                        outbox::retry_count.eq(retry_count),
                        outbox::next_retry_at.eq(next_retry_at),
                        outbox::last_error.eq(last_error),
                        outbox::last_error_code.eq(last_error_code),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    async fn mark_dead(
        &self,
        local_seq: i64,
        retry_count: i32,
        last_error: Option<String>,
        last_error_code: Option<String>,
    ) -> Result<()> {
        self.writer
            .exec(move |conn| {
                diesel::update(outbox::table.find(local_seq))
                    .set((
                        outbox::status.eq(enum_to_db(&OutboxStatus::Dead)?),
                        outbox::retry_count.eq(retry_count),
                        outbox::last_error.eq(last_error),
                        outbox::last_error_code.eq(last_error_code),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    async fn recover_in_flight(&self) -> Result<usize> {
        self.writer
            .exec(move |conn| {
                let recovered = diesel::update(
                    outbox::table.filter(outbox::status.eq(enum_to_db(&OutboxStatus::InFlight)?)),
                )
                .set(outbox::status.eq(enum_to_db(&OutboxStatus::Pending)?))
                .execute(conn)
                .map_err(StorageError::from)?;
                Ok(recovered)
            })
            .await
    }

    async fn requeue_dead(&self, local_seq: i64, now: i64) -> Result<bool> {
        self.writer
            .exec(move |conn| {
                let updated = diesel::update(
                    outbox::table
                        .find(local_seq)
                        .filter(outbox::status.eq(enum_to_db(&OutboxStatus::Dead)?)),
                )
                .set((
                    outbox::status.eq(enum_to_db(&OutboxStatus::Pending)?),
                    outbox::retry_count.eq(0),
                    outbox::next_retry_at.eq(now),
                    outbox::last_error.eq::<Option<String>>(None),
                    outbox::last_error_code.eq::<Option<String>>(None),
                ))
                .execute(conn)
                .map_err(StorageError::from)?;
                Ok(updated > 0)
            })
            .await
    }

    async fn discard(&self, local_seq: i64) -> Result<bool> {
        self.writer
            .exec(move |conn| {
                let Some(row) = outbox::table
                    .find(local_seq)
                    .first::<OutboxEntryDB>(conn)
                    .optional()
                    .map_err(StorageError::from)?
                else {
                    return Ok(false);
                };

                // A discarded send leaves no optimistic message behind.
                if row.kind == enum_to_db(&OutboxMutationKind::SendMessage)? {
                    diesel::delete(messages::table.find(&row.entity_id))
                        .execute(conn)
                        .map_err(StorageError::from)?;
                }
                diesel::delete(outbox::table.find(local_seq))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(true)
            })
            .await
    }

    fn get_entry(&self, local_seq: i64) -> Result<Option<OutboxEntry>> {
        let mut conn = get_connection(&self.pool)?;
        outbox::table
            .find(local_seq)
            .first::<OutboxEntryDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .map(to_outbox_entry)
            .transpose()
    }

    fn list_entries(&self, status: Option<OutboxStatus>) -> Result<Vec<OutboxEntry>> {
        let mut conn = get_connection(&self.pool)?;
        let mut query = outbox::table.into_boxed();
        if let Some(status) = status {
            query = query.filter(outbox::status.eq(enum_to_db(&status)?));
        }
        query
            .order((outbox::next_retry_at.asc(), outbox::local_seq.asc()))
            .load::<OutboxEntryDB>(&mut conn)
            .map_err(StorageError::from)?
            .into_iter()
            .map(to_outbox_entry)
            .collect()
    }

    fn next_due_at(&self) -> Result<Option<i64>> {
        let mut conn = get_connection(&self.pool)?;
        let due = outbox::table
            .filter(outbox::status.eq(enum_to_db(&OutboxStatus::Pending)?))
            .select(diesel::dsl::min(outbox::next_retry_at))
            .first::<Option<i64>>(&mut conn)
            .map_err(StorageError::from)?;
        Ok(due)
    }
}
