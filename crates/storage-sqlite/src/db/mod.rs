//! Connection pool, migrations and startup schema evolution.

pub mod write_actor;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{self, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use huddle_core::errors::Result;

use crate::errors::StorageError;

pub use write_actor::{spawn_writer, WriteHandle};
pub(crate) use write_actor::savepoint;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub const DB_FILE_NAME: &str = "huddle.db";

pub type DbPool = Pool<r2d2::ConnectionManager<SqliteConnection>>;
pub type DbConnection = PooledConnection<r2d2::ConnectionManager<SqliteConnection>>;

/// Per-connection settings applied whenever the pool hands out a connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Passphrase for an encrypted database. Only effective with the
    /// `sqlcipher` feature.
    pub encryption_key: Option<String>,
    pub busy_timeout: Duration,
    pub max_pool_size: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            encryption_key: None,
            busy_timeout: Duration::from_secs(5),
            max_pool_size: 8,
        }
    }
}

impl ConnectionOptions {
    fn apply(&self, conn: &mut SqliteConnection) -> diesel::QueryResult<()> {
        if let Some(key) = self.encryption_key.as_deref().filter(|k| !k.is_empty()) {
            conn.batch_execute(&format!("PRAGMA key = '{}';", key.replace('\'', "''")))?;
        }
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;",
            self.busy_timeout.as_millis()
        ))
    }
}

impl CustomizeConnection<SqliteConnection, r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), r2d2::Error> {
        self.apply(conn).map_err(r2d2::Error::QueryError)
    }
}

/// Ensures the data directory exists and returns the database path inside it.
pub fn init(app_data_dir: &str) -> Result<String> {
    std::fs::create_dir_all(app_data_dir).map_err(StorageError::from)?;
    let db_path = Path::new(app_data_dir).join(DB_FILE_NAME);
    Ok(db_path.to_string_lossy().to_string())
}

pub fn create_pool(db_path: &str, options: &ConnectionOptions) -> Result<Arc<DbPool>> {
    let manager = r2d2::ConnectionManager::<SqliteConnection>::new(db_path);
    let pool = Pool::builder()
        .max_size(options.max_pool_size.max(1))
        .connection_customizer(Box::new(options.clone()))
        .build(manager)
        .map_err(StorageError::from)?;
    Ok(Arc::new(pool))
}

pub fn get_connection(pool: &DbPool) -> Result<DbConnection> {
    Ok(pool.get().map_err(StorageError::from)?)
}

/// Applies pending embedded migrations, then the additive schema evolution
/// steps. Safe to run on every startup.
pub fn run_migrations(db_path: &str, options: &ConnectionOptions) -> Result<()> {
    let mut conn = SqliteConnection::establish(db_path).map_err(StorageError::from)?;
    options.apply(&mut conn).map_err(StorageError::from)?;

    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|err| StorageError::Migration(err.to_string()))?;
    if !applied.is_empty() {
        log::info!("[Store] Applied {} migration(s)", applied.len());
    }

    evolve_schema(&mut conn)
}

/// Column added after the first release. Older databases get it on startup.
struct ColumnEvolution {
    table: &'static str,
    column: &'static str,
    definition: &'static str,
}

const COLUMN_EVOLUTIONS: &[ColumnEvolution] = &[
    ColumnEvolution {
        table: "messages",
        column: "is_ghost",
        definition: "BOOLEAN NOT NULL DEFAULT 0",
    },
    ColumnEvolution {
        table: "messages",
        column: "category",
        definition: "TEXT",
    },
    ColumnEvolution {
        table: "messages",
        column: "image_url",
        definition: "TEXT",
    },
    ColumnEvolution {
        table: "outbox",
        column: "last_error_code",
        definition: "TEXT",
    },
];

const INDEX_EVOLUTIONS: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_messages_parent ON messages(parent_id)",
    "CREATE INDEX IF NOT EXISTS idx_outbox_kind_actor ON outbox(kind, conversation_id, actor_id)",
];

#[derive(diesel::QueryableByName)]
struct PragmaTableInfoRow {
    #[diesel(sql_type = diesel::sql_types::Text)]
    name: String,
}

fn escape_sqlite_str(value: &str) -> String {
    value.replace('\'', "''")
}

pub(crate) fn load_table_columns(
    conn: &mut SqliteConnection,
    table_name: &str,
) -> Result<Vec<String>> {
    let sql = format!(
        "PRAGMA main.table_info('{}')",
        escape_sqlite_str(table_name)
    );
    let columns = diesel::sql_query(sql)
        .load::<PragmaTableInfoRow>(conn)
        .map_err(StorageError::from)?
        .into_iter()
        .map(|row| row.name)
        .collect::<Vec<_>>();
    Ok(columns)
}

/// Adds missing columns and indexes. Each step checks before it alters, so a
/// second run changes nothing.
pub fn evolve_schema(conn: &mut SqliteConnection) -> Result<()> {
    let mut added = 0usize;
    for evolution in COLUMN_EVOLUTIONS {
        let columns = load_table_columns(conn, evolution.table)?;
        if columns.is_empty() || columns.iter().any(|c| c == evolution.column) {
            continue;
        }
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            evolution.table, evolution.column, evolution.definition
        );
        diesel::sql_query(sql)
            .execute(conn)
            .map_err(StorageError::from)?;
        added += 1;
        log::info!(
            "[Store] Added column {}.{}",
            evolution.table,
            evolution.column
        );
    }

    for statement in INDEX_EVOLUTIONS {
        conn.batch_execute(statement).map_err(StorageError::from)?;
    }

    log::debug!("[Store] Schema evolution complete ({} column(s) added)", added);
    Ok(())
}
