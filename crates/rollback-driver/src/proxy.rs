//! Interception proxy around the managed connection.
//!
//! `RollbackConnection` implements the same [`Connection`] capability set as
//! the connection it wraps. Four operations are intercepted and decided by
//! the owning instance's `transactions_enabled` flag:
//!
//! | call              | enabled                 | disabled |
//! |-------------------|-------------------------|----------|
//! | `set_auto_commit` | forward                 | suppress |
//! | `commit`          | forward, reset isolation| suppress |
//! | `rollback`        | forward, reset isolation| suppress |
//! | `close`           | suppress                | suppress |
//!
//! Everything else is forwarded unconditionally. Errors from the wrapped
//! connection, including a failed isolation reset, are returned unchanged.

use std::fmt;
use std::sync::Arc;

use crate::connection::Connection;
use crate::instance::{InstanceState, ManagedConnection};

/// Operations the proxy intercepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intercept {
    SetAutoCommit,
    Commit,
    Rollback,
    Close,
}

/// What the proxy does with an intercepted call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Forward,
    ForwardAndResetIsolation,
    Suppress,
}

impl Intercept {
    pub fn action(self, transactions_enabled: bool) -> Action {
        match (self, transactions_enabled) {
            // the connection lives for the whole session of the instance
            (Self::Close, _) => Action::Suppress,
            (_, false) => Action::Suppress,
            (Self::SetAutoCommit, true) => Action::Forward,
            (Self::Commit | Self::Rollback, true) => Action::ForwardAndResetIsolation,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::SetAutoCommit => "set_auto_commit",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Close => "close",
        }
    }
}

/// Cloneable handle to an instance's managed connection
pub struct RollbackConnection<C: Connection> {
    instance: Arc<InstanceState<C>>,
    managed: Arc<ManagedConnection<C>>,
}

impl<C: Connection> RollbackConnection<C> {
    /// Wrap a freshly opened connection and install it as the instance's
    /// managed connection.
    ///
    /// Auto-commit is switched off and the isolation statement issued once
    /// before the handle is returned. If the instance already has a managed
    /// connection, the new one is dropped and a handle to the existing one
    /// is returned.
    pub(crate) fn wrap(
        instance: Arc<InstanceState<C>>,
        mut connection: C,
        isolation_statement: &str,
    ) -> Result<Self, C::Error> {
        connection.set_auto_commit(false)?;
        connection.execute(isolation_statement)?;

        let managed = Arc::new(ManagedConnection::new(connection, isolation_statement));
        if !instance.install(managed.clone()) {
            tracing::warn!(
                instance = %instance.id(),
                "Instance already manages a connection, discarding the new one"
            );
            if let Some(existing) = instance.managed() {
                return Ok(Self::from_parts(instance.clone(), existing.clone()));
            }
        }
        Ok(Self::from_parts(instance, managed))
    }

    pub(crate) fn from_parts(
        instance: Arc<InstanceState<C>>,
        managed: Arc<ManagedConnection<C>>,
    ) -> Self {
        Self { instance, managed }
    }

    /// The instance whose flag governs this connection
    pub fn instance(&self) -> &Arc<InstanceState<C>> {
        &self.instance
    }

    fn intercept<F>(&self, op: Intercept, call: F) -> Result<(), C::Error>
    where
        F: FnOnce(&mut C) -> Result<(), C::Error>,
    {
        let enabled = self.instance.transactions_enabled();
        let label = self.instance.label();

        match op.action(enabled) {
            Action::Suppress => {
                tracing::trace!(label = %label, call = op.name(), "blocking");
                Ok(())
            }
            Action::Forward => {
                tracing::trace!(label = %label, call = op.name(), "allowing");
                call(&mut *self.managed.lock())
            }
            Action::ForwardAndResetIsolation => {
                tracing::debug!(label = %label, call = op.name(), "allowing, then resetting isolation");
                let mut connection = self.managed.lock();
                call(&mut *connection)?;
                self.managed.reset_isolation(&mut connection)
            }
        }
    }
}

impl<C: Connection> Clone for RollbackConnection<C> {
    fn clone(&self) -> Self {
        Self {
            instance: self.instance.clone(),
            managed: self.managed.clone(),
        }
    }
}

impl<C: Connection> fmt::Debug for RollbackConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackConnection")
            .field("instance", &self.instance.id())
            .field("label", &self.instance.label())
            .field("transactions_enabled", &self.instance.transactions_enabled())
            .finish()
    }
}

impl<C: Connection> Connection for RollbackConnection<C> {
    type Error = C::Error;

    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), Self::Error> {
        self.intercept(Intercept::SetAutoCommit, |c| c.set_auto_commit(auto_commit))
    }

    fn auto_commit(&self) -> Result<bool, Self::Error> {
        self.managed.lock().auto_commit()
    }

    fn commit(&mut self) -> Result<(), Self::Error> {
        self.intercept(Intercept::Commit, |c| c.commit())
    }

    fn rollback(&mut self) -> Result<(), Self::Error> {
        self.intercept(Intercept::Rollback, |c| c.rollback())
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.intercept(Intercept::Close, |c| c.close())
    }

    fn execute(&mut self, sql: &str) -> Result<usize, Self::Error> {
        self.managed.lock().execute(sql)
    }

    fn query_i64(&mut self, sql: &str) -> Result<Option<i64>, Self::Error> {
        self.managed.lock().query_i64(sql)
    }
}
