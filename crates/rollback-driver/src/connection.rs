//! Capability set required from the wrapped database driver.

use std::fmt;

use rollback_common::constants::READ_UNCOMMITTED_STATEMENT;

/// Credentials handed through to the wrapped driver untouched
#[derive(Clone, Default)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            password: Some(password.into()),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// A live database session.
///
/// Only `set_auto_commit`, `commit`, `rollback` and `close` are intercepted
/// by [`RollbackConnection`](crate::RollbackConnection); every other method
/// is forwarded as-is.
pub trait Connection: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), Self::Error>;

    fn auto_commit(&self) -> Result<bool, Self::Error>;

    fn commit(&mut self) -> Result<(), Self::Error>;

    fn rollback(&mut self) -> Result<(), Self::Error>;

    fn close(&mut self) -> Result<(), Self::Error>;

    /// Execute a statement, returning the number of affected rows
    fn execute(&mut self, sql: &str) -> Result<usize, Self::Error>;

    /// Run a query and return the first column of the first row, if any
    fn query_i64(&mut self, sql: &str) -> Result<Option<i64>, Self::Error>;
}

/// Opens connections for a coordinating instance
pub trait Driver: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(
        &self,
        dsn: &str,
        credentials: &Credentials,
    ) -> Result<Self::Connection, <Self::Connection as Connection>::Error>;

    /// Statement that switches the session to read-uncommitted.
    ///
    /// Issued once when a connection is wrapped and again after every real
    /// commit or rollback.
    fn isolation_statement(&self) -> &str {
        READ_UNCOMMITTED_STATEMENT
    }
}
