//! Error taxonomy shared by every Huddle crate.

use thiserror::Error;

use crate::sync::SyncRetryClass;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database operation failed: {0}")]
    Database(#[from] DatabaseError),

    #[error("Remote call failed ({class:?}): {message}")]
    Remote {
        class: SyncRetryClass,
        status: Option<u16>,
        message: String,
    },

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Parent row missing: {entity} {entity_id} references {parent_kind} {parent_id}")]
    MissingParent {
        entity: String,
        entity_id: String,
        parent_kind: String,
        parent_id: String,
    },

    #[error("Mutation {mutation_id} was evicted after {attempts} attempts: {reason}")]
    Poisoned {
        mutation_id: String,
        attempts: i32,
        reason: String,
    },

    #[error("Session unavailable: {0}")]
    Session(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation canceled: {0}")]
    Canceled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Failed to create connection pool: {0}")]
    PoolCreationFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Foreign key constraint violated: {0}")]
    ForeignKeyViolation(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Internal database error: {0}")]
    Internal(String),
}

impl Error {
    /// How the outbox and the stream should react to this failure.
    pub fn retry_class(&self) -> SyncRetryClass {
        match self {
            Error::Remote { class, .. } => *class,
            Error::Timeout(_) | Error::Database(DatabaseError::ConnectionFailed(_)) => {
                SyncRetryClass::Retryable
            }
            Error::Session(_) => SyncRetryClass::ReauthRequired,
            Error::Database(_) | Error::Internal(_) => SyncRetryClass::Retryable,
            Error::MissingParent { .. }
            | Error::Poisoned { .. }
            | Error::Serialization(_)
            | Error::InvalidInput(_)
            | Error::NotFound(_)
            | Error::Canceled(_) => SyncRetryClass::Permanent,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Short machine-readable code persisted next to outbox failures.
    pub fn code(&self) -> String {
        match self {
            Error::Remote {
                status: Some(status),
                ..
            } => format!("http_{}", status),
            Error::Remote { .. } => "transport".to_string(),
            Error::Timeout(_) => "timeout".to_string(),
            Error::Session(_) => "session".to_string(),
            Error::Database(_) => "database".to_string(),
            Error::MissingParent { .. } => "missing_parent".to_string(),
            Error::Poisoned { .. } => "poisoned".to_string(),
            Error::Serialization(_) => "serialization".to_string(),
            Error::InvalidInput(_) => "invalid_input".to_string(),
            Error::NotFound(_) => "not_found".to_string(),
            Error::Canceled(_) => "canceled".to_string(),
            Error::Internal(_) => "internal".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_keep_their_class() {
        let err = Error::Remote {
            class: SyncRetryClass::ReauthRequired,
            status: Some(401),
            message: "expired".to_string(),
        };
        assert_eq!(err.retry_class(), SyncRetryClass::ReauthRequired);
        assert_eq!(err.code(), "http_401");
    }

    #[test]
    fn ordering_and_poison_errors_are_not_retried() {
        let missing = Error::MissingParent {
            entity: "message".to_string(),
            entity_id: "m1".to_string(),
            parent_kind: "conversation".to_string(),
            parent_id: "c1".to_string(),
        };
        assert_eq!(missing.retry_class(), SyncRetryClass::Permanent);
        assert_eq!(Error::Timeout(500).retry_class(), SyncRetryClass::Retryable);
    }
}
