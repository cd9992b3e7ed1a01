//! Single writer for the local store.
//!
//! Every write job runs on one dedicated thread, inside an immediate
//! transaction, in submission order. Readers use pool connections and never
//! queue behind writes.

use diesel::connection::Connection;
use diesel::r2d2::{self, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use tokio::sync::{mpsc, oneshot};

use huddle_core::errors::{DatabaseError, Error, Result};

use crate::errors::StorageError;

type DbManager = r2d2::ConnectionManager<SqliteConnection>;
type Job = Box<dyn FnOnce(Option<&mut SqliteConnection>) + Send + 'static>;

const WRITER_QUEUE_DEPTH: usize = 1024;

/// Cloneable handle to the writer thread.
#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::Sender<Job>,
}

/// Carries either a job error or a transaction-management error out of
/// diesel's transaction API.
pub(crate) enum TxError {
    Job(Error),
    Diesel(diesel::result::Error),
}

impl From<diesel::result::Error> for TxError {
    fn from(err: diesel::result::Error) -> Self {
        TxError::Diesel(err)
    }
}

impl From<TxError> for Error {
    fn from(err: TxError) -> Self {
        match err {
            TxError::Job(err) => err,
            TxError::Diesel(err) => StorageError::from(err).into(),
        }
    }
}

/// Runs `f` in a nested transaction (a savepoint when already inside one).
/// A failure rolls back only the work done by `f`.
pub(crate) fn savepoint<T, F>(conn: &mut SqliteConnection, f: F) -> Result<T>
where
    F: FnOnce(&mut SqliteConnection) -> Result<T>,
{
    conn.transaction::<T, TxError, _>(|conn| f(conn).map_err(TxError::Job))
        .map_err(Error::from)
}

impl WriteHandle {
    /// Runs `job` inside a write transaction. An `Err` rolls back everything
    /// the job wrote.
    pub async fn exec<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<T>>();
        let wrapped: Job = Box::new(move |conn| {
            let result = match conn {
                Some(conn) => conn
                    .immediate_transaction::<T, TxError, _>(|conn| job(conn).map_err(TxError::Job))
                    .map_err(Error::from),
                None => Err(Error::Database(DatabaseError::ConnectionFailed(
                    "writer has no database connection".to_string(),
                ))),
            };
            let _ = reply_tx.send(result);
        });

        self.tx.send(wrapped).await.map_err(|_| {
            Error::Database(DatabaseError::Internal(
                "Database writer is not running".to_string(),
            ))
        })?;

        reply_rx.await.map_err(|_| {
            Error::Database(DatabaseError::Internal(
                "Database writer dropped the job".to_string(),
            ))
        })?
    }
}

/// Starts the writer thread for `pool`.
pub fn spawn_writer(pool: Pool<DbManager>) -> WriteHandle {
    let (tx, rx) = mpsc::channel::<Job>(WRITER_QUEUE_DEPTH);

    let spawned = std::thread::Builder::new()
        .name("huddle-db-writer".to_string())
        .spawn(move || run_writer(pool, rx));
    if let Err(err) = spawned {
        log::error!("[Store] Failed to start database writer: {}", err);
    }

    WriteHandle { tx }
}

fn run_writer(pool: Pool<DbManager>, mut rx: mpsc::Receiver<Job>) {
    let mut conn: Option<PooledConnection<DbManager>> = None;

    while let Some(job) = rx.blocking_recv() {
        if conn.is_none() {
            match pool.get() {
                Ok(fresh) => conn = Some(fresh),
                Err(err) => log::error!("[Store] Writer failed to get a connection: {}", err),
            }
        }
        job(conn.as_deref_mut());
    }

    log::debug!("[Store] Database writer stopped");
}
