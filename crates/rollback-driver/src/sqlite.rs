//! SQLite backend for the wrapped-driver interface.
//!
//! SQLite has no session-level auto-commit switch, so it is emulated: with
//! auto-commit off, a deferred transaction is opened before the next
//! statement and stays open until `commit` or `rollback`.

use rusqlite::OptionalExtension;
use std::time::Duration;
use thiserror::Error;

use crate::connection::{Connection, Credentials, Driver};

/// Statement used instead of the standard read-uncommitted statement
pub const SQLITE_ISOLATION_STATEMENT: &str = "PRAGMA read_uncommitted = 1";

const BUSY_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum SqliteError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection is closed")]
    Closed,
}

/// Opens SQLite databases. DSNs are a file path, `:memory:`, or either
/// prefixed with `sqlite:`.
#[derive(Debug, Clone, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Driver for SqliteDriver {
    type Connection = SqliteConnection;

    fn connect(&self, dsn: &str, _credentials: &Credentials) -> Result<SqliteConnection, SqliteError> {
        let path = dsn.strip_prefix("sqlite:").unwrap_or(dsn);
        let conn = if path == ":memory:" {
            rusqlite::Connection::open_in_memory()?
        } else {
            rusqlite::Connection::open(path)?
        };
        conn.busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS))?;

        tracing::debug!(path = %path, "SQLite connection opened");
        Ok(SqliteConnection::new(conn))
    }

    fn isolation_statement(&self) -> &str {
        SQLITE_ISOLATION_STATEMENT
    }
}

pub struct SqliteConnection {
    conn: Option<rusqlite::Connection>,
    auto_commit: bool,
}

impl SqliteConnection {
    pub fn new(conn: rusqlite::Connection) -> Self {
        Self {
            conn: Some(conn),
            auto_commit: true,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.conn.as_ref().is_some_and(|conn| !conn.is_autocommit())
    }

    fn open(&self) -> Result<&rusqlite::Connection, SqliteError> {
        self.conn.as_ref().ok_or(SqliteError::Closed)
    }

    /// The connection, inside a transaction when auto-commit is off
    fn statement_conn(&self) -> Result<&rusqlite::Connection, SqliteError> {
        let conn = self.open()?;
        if !self.auto_commit && conn.is_autocommit() {
            conn.execute_batch("BEGIN DEFERRED")?;
        }
        Ok(conn)
    }

    fn finish(&self, statement: &str) -> Result<(), SqliteError> {
        let conn = self.open()?;
        if !conn.is_autocommit() {
            conn.execute_batch(statement)?;
        }
        Ok(())
    }
}

impl Connection for SqliteConnection {
    type Error = SqliteError;

    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), SqliteError> {
        if auto_commit && !self.auto_commit {
            self.finish("COMMIT")?;
        }
        self.auto_commit = auto_commit;
        Ok(())
    }

    fn auto_commit(&self) -> Result<bool, SqliteError> {
        self.open()?;
        Ok(self.auto_commit)
    }

    fn commit(&mut self) -> Result<(), SqliteError> {
        self.finish("COMMIT")
    }

    fn rollback(&mut self) -> Result<(), SqliteError> {
        self.finish("ROLLBACK")
    }

    fn close(&mut self) -> Result<(), SqliteError> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")?;
        }
        conn.close().map_err(|(_, e)| SqliteError::Sqlite(e))
    }

    fn execute(&mut self, sql: &str) -> Result<usize, SqliteError> {
        Ok(self.statement_conn()?.execute(sql, [])?)
    }

    fn query_i64(&mut self, sql: &str) -> Result<Option<i64>, SqliteError> {
        Ok(self
            .statement_conn()?
            .query_row(sql, [], |row| row.get(0))
            .optional()?)
    }
}
