use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::error::QuickTodoError;
use crate::schema::{CREATE_SCHEMA_SQL, SCHEMA_VERSION};

const DB_FILENAME: &str = "quicktodo.db";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_SIZE: u32 = 4;

pub type PooledConn = PooledConnection<SqliteConnectionManager>;

/// Pooled handle to the task database. Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    db_path: PathBuf,
}

impl Database {
    /// Open (creating if needed) the database in `db_dir` and make sure the schema is current.
    pub fn open(db_dir: &Path) -> Result<Self, QuickTodoError> {
        if !db_dir.exists() {
            fs::create_dir_all(db_dir)?;
        }
        if !db_dir.is_dir() {
            return Err(QuickTodoError::Error(format!(
                "Database folder '{}' is not a directory",
                db_dir.display()
            )));
        }

        let db_path = db_dir.join(DB_FILENAME);
        let manager = SqliteConnectionManager::file(&db_path).with_init(Self::init_connection);
        let pool = Pool::builder().max_size(POOL_SIZE).build(manager)?;

        let db = Database { pool, db_path };
        db.ensure_schema()?;

        info!("Database opened at: {}", db.db_path.display());
        Ok(db)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn get_connection(&self) -> Result<PooledConn, QuickTodoError> {
        Ok(self.pool.get()?)
    }

    /// A connection outside the pool, used by observers that need per-connection
    /// state such as `PRAGMA data_version`.
    pub fn open_dedicated_connection(&self) -> Result<Connection, QuickTodoError> {
        let mut conn = Connection::open(&self.db_path)?;
        Self::init_connection(&mut conn)?;
        Ok(conn)
    }

    /// Run `func` inside a `BEGIN IMMEDIATE` transaction, committing on success.
    pub fn immediate_transaction<T, F>(conn: &mut Connection, func: F) -> Result<T, QuickTodoError>
    where
        F: FnOnce(&Transaction) -> Result<T, QuickTodoError>,
    {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = func(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// SQLite's `data_version` for this connection. It changes whenever another
    /// connection commits to the database file.
    pub fn data_version(conn: &Connection) -> Result<i64, QuickTodoError> {
        let version = conn.query_row("PRAGMA data_version", [], |row| row.get(0))?;
        Ok(version)
    }

    fn init_connection(conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))?;
        Ok(())
    }

    fn ensure_schema(&self) -> Result<(), QuickTodoError> {
        let conn = self.get_connection()?;

        let table_exists: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)?;

        if !table_exists {
            info!("Creating database schema v{}", SCHEMA_VERSION);
            conn.execute_batch(CREATE_SCHEMA_SQL)?;
            return Ok(());
        }

        let stored_version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()),
            Some(other) => Err(QuickTodoError::Error(format!(
                "Schema version mismatch: database has v{}, expected v{}",
                other, SCHEMA_VERSION
            ))),
            None => Err(QuickTodoError::Error("Schema version missing".to_string())),
        }
    }
}
