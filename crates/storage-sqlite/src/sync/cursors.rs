//! Repository for per-collection reconciliation cursors.

use std::sync::Arc;

use async_trait::async_trait;
use diesel::prelude::*;

use huddle_core::errors::Result;
use huddle_core::sync::{Collection, SyncCursor, SyncCursorRepositoryTrait};

use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::sync_cursors;
use crate::utils::{enum_from_db, enum_to_db};

use super::model::SyncCursorDB;

pub struct SyncCursorRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl SyncCursorRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }
}

#[async_trait]
impl SyncCursorRepositoryTrait for SyncCursorRepository {
    fn get_cursor(&self, collection: Collection) -> Result<SyncCursor> {
        let mut conn = get_connection(&self.pool)?;
        let row = sync_cursors::table
            .find(enum_to_db(&collection)?)
            .first::<SyncCursorDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;

        match row {
            Some(row) => Ok(SyncCursor {
                collection: enum_from_db(&row.collection)?,
                last_sync_timestamp: row.last_sync_timestamp,
                checksum: row.checksum,
                updated_at: row.updated_at,
            }),
            None => Ok(SyncCursor::initial(collection)),
        }
    }

    async fn save_cursor(&self, cursor: SyncCursor) -> Result<()> {
        self.writer
            .exec(move |conn| {
                let row = SyncCursorDB {
                    collection: enum_to_db(&cursor.collection)?,
                    last_sync_timestamp: cursor.last_sync_timestamp,
                    checksum: cursor.checksum,
                    updated_at: cursor.updated_at,
                };

                diesel::insert_into(sync_cursors::table)
                    .values(&row)
                    .on_conflict(sync_cursors::collection)
                    .do_update()
                    .set(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }
}
