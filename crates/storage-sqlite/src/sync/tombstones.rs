//! Repository for deletion tombstones.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use huddle_core::errors::Result;
use huddle_core::sync::{Tombstone, TombstoneRepositoryTrait};

use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::tombstones;
use crate::utils::{enum_from_db, enum_to_db};

use super::model::TombstoneDB;

/// Records a tombstone on `conn`, keeping the latest `deleted_at`.
pub fn write_tombstone(conn: &mut SqliteConnection, tombstone: &Tombstone) -> Result<()> {
    let row = TombstoneDB {
        entity_id: tombstone.entity_id.clone(),
        entity_kind: enum_to_db(&tombstone.entity_kind)?,
        deleted_at: tombstone.deleted_at,
    };
    diesel::insert_into(tombstones::table)
        .values(&row)
        .on_conflict(tombstones::entity_id)
        .do_update()
        .set(tombstones::deleted_at.eq(tombstone.deleted_at))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

pub(crate) fn is_tombstoned(conn: &mut SqliteConnection, entity_id: &str) -> Result<bool> {
    let found = tombstones::table
        .find(entity_id)
        .select(tombstones::entity_id)
        .first::<String>(conn)
        .optional()
        .map_err(StorageError::from)?;
    Ok(found.is_some())
}

fn to_tombstone(row: TombstoneDB) -> Result<Tombstone> {
    Ok(Tombstone {
        entity_id: row.entity_id,
        entity_kind: enum_from_db(&row.entity_kind)?,
        deleted_at: row.deleted_at,
    })
}

pub struct TombstoneRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl TombstoneRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }
}

#[async_trait]
impl TombstoneRepositoryTrait for TombstoneRepository {
    async fn mark_deleted(&self, tombstone: Tombstone) -> Result<()> {
        self.writer
            .exec(move |conn| write_tombstone(conn, &tombstone))
            .await
    }

    fn is_deleted(&self, entity_id: &str) -> Result<bool> {
        let mut conn = get_connection(&self.pool)?;
        is_tombstoned(&mut conn, entity_id)
    }

    fn deleted_among(&self, entity_ids: &[String]) -> Result<HashSet<String>> {
        if entity_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let mut conn = get_connection(&self.pool)?;
        let mut found = HashSet::new();
        // Stay well below SQLite's bound-parameter limit.
        for chunk in entity_ids.chunks(500) {
            let ids = tombstones::table
                .filter(tombstones::entity_id.eq_any(chunk))
                .select(tombstones::entity_id)
                .load::<String>(&mut conn)
                .map_err(StorageError::from)?;
            found.extend(ids);
        }
        Ok(found)
    }

    fn list_tombstones(&self) -> Result<Vec<Tombstone>> {
        let mut conn = get_connection(&self.pool)?;
        tombstones::table
            .order(tombstones::deleted_at.asc())
            .load::<TombstoneDB>(&mut conn)
            .map_err(StorageError::from)?
            .into_iter()
            .map(to_tombstone)
            .collect()
    }

    async fn purge_before(&self, cutoff: i64) -> Result<usize> {
        self.writer
            .exec(move |conn| {
                let purged = diesel::delete(tombstones::table.filter(tombstones::deleted_at.lt(cutoff)))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(purged)
            })
            .await
    }
}
