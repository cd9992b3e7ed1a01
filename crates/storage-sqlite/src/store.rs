use std::sync::Arc;

use diesel::sqlite::SqliteConnection;

use huddle_core::errors::Result;

use crate::db::{self, ConnectionOptions, DbPool, WriteHandle};
use crate::messaging::{MessagingRepository, ReadStateRepository};
use crate::sync::{OutboxRepository, SyncCursorRepository, TombstoneRepository};

/// An opened, migrated database plus its writer. Cheap to clone.
#[derive(Clone)]
pub struct LocalStore {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl LocalStore {
    /// Creates `data_dir` if needed, migrates the database inside it and
    /// starts the writer thread.
    pub fn open(data_dir: &str, options: ConnectionOptions) -> Result<Self> {
        let db_path = db::init(data_dir)?;
        db::run_migrations(&db_path, &options)?;
        let pool = db::create_pool(&db_path, &options)?;
        let writer = db::spawn_writer(pool.as_ref().clone());
        log::info!("[Store] Opened local store at {}", db_path);
        Ok(Self { pool, writer })
    }

    pub fn pool(&self) -> Arc<DbPool> {
        Arc::clone(&self.pool)
    }

    pub fn writer(&self) -> WriteHandle {
        self.writer.clone()
    }

    /// Runs `job` as one write transaction on the writer thread.
    pub async fn transaction<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.writer.exec(job).await
    }

    pub fn messaging(&self) -> MessagingRepository {
        MessagingRepository::new(self.pool(), self.writer())
    }

    pub fn read_state(&self) -> ReadStateRepository {
        ReadStateRepository::new(self.pool(), self.writer())
    }

    pub fn outbox(&self) -> OutboxRepository {
        OutboxRepository::new(self.pool(), self.writer())
    }

    pub fn tombstones(&self) -> TombstoneRepository {
        TombstoneRepository::new(self.pool(), self.writer())
    }

    pub fn cursors(&self) -> SyncCursorRepository {
        SyncCursorRepository::new(self.pool(), self.writer())
    }
}
