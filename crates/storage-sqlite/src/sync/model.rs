//! Database models for outbox, tombstone and cursor tables.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Queryable,
    Identifiable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(local_seq))]
#[diesel(table_name = crate::schema::outbox)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct OutboxEntryDB {
    pub local_seq: i64,
    pub mutation_id: String,
    pub kind: String,
    pub conversation_id: String,
    pub actor_id: String,
    pub entity_id: String,
    pub payload: String,
    pub status: String,
    pub retry_count: i32,
    pub next_retry_at: i64,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,
    pub created_at: i64,
}

/// Insert shape for the outbox; `local_seq` is assigned by SQLite.
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::outbox)]
pub struct NewOutboxEntryDB {
    pub mutation_id: String,
    pub kind: String,
    pub conversation_id: String,
    pub actor_id: String,
    pub entity_id: String,
    pub payload: String,
    pub status: String,
    pub retry_count: i32,
    pub next_retry_at: i64,
    pub created_at: i64,
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(entity_id))]
#[diesel(table_name = crate::schema::tombstones)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct TombstoneDB {
    pub entity_id: String,
    pub entity_kind: String,
    pub deleted_at: i64,
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(collection))]
#[diesel(table_name = crate::schema::sync_cursors)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct SyncCursorDB {
    pub collection: String,
    pub last_sync_timestamp: i64,
    pub checksum: Option<String>,
    pub updated_at: i64,
}
