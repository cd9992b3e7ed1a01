//! Storage-level errors and their mapping into the core taxonomy.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

use huddle_core::errors::{DatabaseError, Error};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Query failed: {0}")]
    Query(#[from] DieselError),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Connection failed: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        let db_error = match err {
            StorageError::Query(DieselError::NotFound) => {
                DatabaseError::NotFound("record not found".to_string())
            }
            StorageError::Query(DieselError::DatabaseError(kind, info)) => match kind {
                DatabaseErrorKind::UniqueViolation => {
                    DatabaseError::UniqueViolation(info.message().to_string())
                }
                DatabaseErrorKind::ForeignKeyViolation => {
                    DatabaseError::ForeignKeyViolation(info.message().to_string())
                }
                _ => DatabaseError::QueryFailed(info.message().to_string()),
            },
            StorageError::Query(other) => DatabaseError::QueryFailed(other.to_string()),
            StorageError::Pool(err) => DatabaseError::ConnectionFailed(err.to_string()),
            StorageError::Connection(err) => DatabaseError::ConnectionFailed(err.to_string()),
            StorageError::Migration(message) => DatabaseError::MigrationFailed(message),
            StorageError::Io(err) => DatabaseError::Internal(err.to_string()),
        };
        Error::Database(db_error)
    }
}
