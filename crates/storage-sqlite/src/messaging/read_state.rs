//! Read watermarks stored on the membership row.

use std::sync::Arc;

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use huddle_core::errors::Result;
use huddle_core::messaging::{ReadState, ReadStateRepositoryTrait, UnreadBoundary, UnreadCount};
use huddle_core::sync::{NewOutboxEntry, OutboxEntry};

use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::{memberships, messages, tombstones};
use crate::sync::write_outbox_entry;

use super::model::MembershipDB;
use super::repository::conversation_exists;

fn find_read_state(
    conn: &mut SqliteConnection,
    conversation_id: &str,
    actor_id: &str,
) -> Result<Option<ReadState>> {
    Ok(memberships::table
        .find((conversation_id, actor_id))
        .first::<MembershipDB>(conn)
        .optional()
        .map_err(StorageError::from)?
        .map(|row| ReadState::from(huddle_core::messaging::Membership::from(row))))
}

/// Returns the existing read state or creates one that has read nothing.
/// `updated_at = 0` lets any server copy of the membership win.
fn ensure_row(
    conn: &mut SqliteConnection,
    conversation_id: &str,
    actor_id: &str,
    now: i64,
) -> Result<Option<ReadState>> {
    if let Some(existing) = find_read_state(conn, conversation_id, actor_id)? {
        return Ok(Some(existing));
    }
    if !conversation_exists(conn, conversation_id)? {
        return Ok(None);
    }

    diesel::insert_into(memberships::table)
        .values(MembershipDB {
            conversation_id: conversation_id.to_string(),
            actor_id: actor_id.to_string(),
            joined_at: now,
            last_read_at: 0,
            last_read_message_id: None,
            updated_at: 0,
        })
        .execute(conn)
        .map_err(StorageError::from)?;
    log::debug!(
        "[ReadTracker] Created read state for {} in {}",
        actor_id,
        conversation_id
    );
    find_read_state(conn, conversation_id, actor_id)
}

fn count_unread(
    conn: &mut SqliteConnection,
    conversation_id: &str,
    actor_id: &str,
    last_read_at: i64,
) -> Result<UnreadBoundary> {
    let unread = || {
        messages::table
            .filter(messages::conversation_id.eq(conversation_id))
            .filter(messages::created_at.gt(last_read_at))
            .filter(messages::actor_id.ne(actor_id))
            .filter(messages::id.ne_all(tombstones::table.select(tombstones::entity_id)))
    };

    let unread_count = unread()
        .count()
        .get_result::<i64>(conn)
        .map_err(StorageError::from)?;
    let first_unread_id = unread()
        .order((messages::created_at.asc(), messages::id.asc()))
        .select(messages::id)
        .first::<String>(conn)
        .optional()
        .map_err(StorageError::from)?;

    Ok(UnreadBoundary {
        first_unread_id,
        unread_count,
    })
}

/// The filter makes this a MAX: an older watermark never lands.
fn raise_watermark(
    conn: &mut SqliteConnection,
    conversation_id: &str,
    actor_id: &str,
    last_read_at: i64,
    last_read_message_id: Option<String>,
    now: i64,
) -> Result<Option<ReadState>> {
    if ensure_row(conn, conversation_id, actor_id, now)?.is_none() {
        return Ok(None);
    }
    let raised = diesel::update(
        memberships::table
            .find((conversation_id, actor_id))
            .filter(memberships::last_read_at.lt(last_read_at)),
    )
    .set((
        memberships::last_read_at.eq(last_read_at),
        memberships::last_read_message_id.eq(last_read_message_id),
    ))
    .execute(conn)
    .map_err(StorageError::from)?;
    if raised == 0 {
        log::debug!(
            "[ReadTracker] Watermark for {} in {} already at or past {}",
            actor_id,
            conversation_id,
            last_read_at
        );
    }
    find_read_state(conn, conversation_id, actor_id)
}

pub struct ReadStateRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl ReadStateRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        ReadStateRepository { pool, writer }
    }
}

#[async_trait]
impl ReadStateRepositoryTrait for ReadStateRepository {
    fn get_read_state(&self, conversation_id: &str, actor_id: &str) -> Result<Option<ReadState>> {
        let mut conn = get_connection(&self.pool)?;
        find_read_state(&mut conn, conversation_id, actor_id)
    }

    async fn ensure_read_state(
        &self,
        conversation_id: String,
        actor_id: String,
        now: i64,
    ) -> Result<Option<ReadState>> {
        self.writer
            .exec(move |conn| ensure_row(conn, &conversation_id, &actor_id, now))
            .await
    }

    async fn advance_watermark(
        &self,
        conversation_id: String,
        actor_id: String,
        last_read_at: i64,
        last_read_message_id: Option<String>,
        now: i64,
    ) -> Result<Option<ReadState>> {
        self.writer
            .exec(move |conn| {
                raise_watermark(
                    conn,
                    &conversation_id,
                    &actor_id,
                    last_read_at,
                    last_read_message_id,
                    now,
                )
            })
            .await
    }

    async fn mark_read(
        &self,
        conversation_id: String,
        actor_id: String,
        last_read_at: i64,
        last_read_message_id: Option<String>,
        receipt: NewOutboxEntry,
    ) -> Result<Option<(ReadState, Option<OutboxEntry>)>> {
        self.writer
            .exec(move |conn| {
                let Some(state) = raise_watermark(
                    conn,
                    &conversation_id,
                    &actor_id,
                    last_read_at,
                    last_read_message_id,
                    receipt.created_at,
                )?
                else {
                    return Ok(None);
                };
                if state.last_read_at > last_read_at {
                    return Ok(Some((state, None)));
                }
                let queued = write_outbox_entry(conn, receipt)?;
                Ok(Some((state, Some(queued))))
            })
            .await
    }

    fn unread_boundary(
        &self,
        conversation_id: &str,
        actor_id: &str,
        last_read_at: i64,
    ) -> Result<UnreadBoundary> {
        let mut conn = get_connection(&self.pool)?;
        count_unread(&mut conn, conversation_id, actor_id, last_read_at)
    }

    fn unread_counts(&self, actor_id: &str) -> Result<Vec<UnreadCount>> {
        let mut conn = get_connection(&self.pool)?;
        let watermarks = memberships::table
            .filter(memberships::actor_id.eq(actor_id))
            .order(memberships::conversation_id.asc())
            .select((memberships::conversation_id, memberships::last_read_at))
            .load::<(String, i64)>(&mut conn)
            .map_err(StorageError::from)?;

        watermarks
            .into_iter()
            .map(|(conversation_id, last_read_at)| {
                let boundary = count_unread(&mut conn, &conversation_id, actor_id, last_read_at)?;
                Ok(UnreadCount {
                    conversation_id,
                    unread_count: boundary.unread_count,
                })
            })
            .collect()
    }
}
