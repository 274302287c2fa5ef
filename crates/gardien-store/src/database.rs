//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees
//! that migrations are run before any other operation. The file itself is
//! plain SQLite; encryption at rest happens one layer up, where the engine
//! seals whole-database snapshots with a symmetric envelope key.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data
    /// directory (e.g. `~/.local/share/gardien/gardien.db` on Linux).
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("app", "gardien", "gardien").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("gardien.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::configure(conn)
    }

    /// Open an in-memory database. Used by tests and by scratch restores.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(conn)
    }

    /// Open a database file without running migrations or touching its
    /// schema. Restore uses this to inspect a downloaded snapshot before
    /// any of it reaches the live database.
    pub fn open_raw(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    ///
    /// Callers should prefer the typed CRUD helpers, but direct access is
    /// occasionally needed for ad-hoc queries.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return a mutable reference to the underlying connection.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }

    /// Current schema version (`PRAGMA user_version`).
    pub fn schema_version(&self) -> Result<u32> {
        let version: u32 =
            self.conn
                .pragma_query_value(None, "user_version", |row| row.get(0))?;
        Ok(version)
    }

    /// Run any outstanding migrations up to the current schema version.
    pub fn run_migrations(&self) -> Result<()> {
        migrations::run_migrations(&self.conn)
    }

    /// Begin an immediate transaction.
    ///
    /// Mutating operations that touch more than one table go through
    /// explicit begin/commit/rollback so the engine can group a queue
    /// update with the crypto-store checkpoint it depends on.
    pub fn begin_transaction(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    /// Commit the open transaction.
    pub fn commit_transaction(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Roll back the open transaction.
    pub fn rollback_transaction(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Run `f` inside a transaction, committing on `Ok` and rolling back
    /// (then re-raising) on `Err`.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.begin_transaction()?;
        match f(self) {
            Ok(value) => {
                self.commit_transaction()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback_transaction() {
                    tracing::error!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Wipe every table and recreate the schema from scratch.
    ///
    /// Invoked on logout / account deletion. The connection stays usable.
    pub fn clear_sensitive_data(&self) -> Result<()> {
        tracing::info!("clearing all sensitive data");

        self.conn.execute_batch(
            "DROP TABLE IF EXISTS olm_accounts;
             DROP TABLE IF EXISTS olm_sessions;
             DROP TABLE IF EXISTS outbound_p2p_messages;
             DROP TABLE IF EXISTS inbound_p2p_messages;
             DROP TABLE IF EXISTS metadata;
             DROP TABLE IF EXISTS persist_storage;",
        )?;
        self.conn.pragma_update(None, "user_version", 0)?;

        migrations::run_migrations(&self.conn)
    }
}
