//! Per-instance coordination state.
//!
//! An instance owns at most one managed connection and a single
//! `transactions_enabled` flag. The flag is mutated only by the
//! coordination layer and read by the interception proxy on every call.

use parking_lot::{Mutex, MutexGuard, RwLock};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use rollback_common::{InstanceId, Signal};

use crate::connection::Connection;
use crate::proxy::RollbackConnection;

/// Boxed error returned by type-erased instances
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The wrapped connection plus the statement used to re-arm its isolation
pub(crate) struct ManagedConnection<C> {
    connection: Mutex<C>,
    isolation_statement: String,
}

impl<C: Connection> ManagedConnection<C> {
    pub(crate) fn new(connection: C, isolation_statement: impl Into<String>) -> Self {
        Self {
            connection: Mutex::new(connection),
            isolation_statement: isolation_statement.into(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, C> {
        self.connection.lock()
    }

    /// Re-issue the read-uncommitted statement on an already locked connection
    pub(crate) fn reset_isolation(&self, connection: &mut C) -> Result<(), C::Error> {
        connection.execute(&self.isolation_statement).map(|_| ())
    }
}

/// Shared state of one coordinating instance
pub struct InstanceState<C: Connection> {
    id: InstanceId,
    label: RwLock<String>,
    transactions_enabled: AtomicBool,
    disposed: AtomicBool,
    managed: OnceLock<Arc<ManagedConnection<C>>>,
}

impl<C: Connection> InstanceState<C> {
    /// Create a new instance with transactions enabled and no connection yet
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: InstanceId::next(),
            label: RwLock::new(label.into()),
            transactions_enabled: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
            managed: OnceLock::new(),
        })
    }

    /// Create a new instance labelled `instance-xxxxxxxx`
    pub fn with_generated_label() -> Arc<Self> {
        Self::new(generate_label())
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn label(&self) -> String {
        self.label.read().clone()
    }

    pub fn set_label(&self, label: impl Into<String>) {
        *self.label.write() = label.into();
    }

    pub fn transactions_enabled(&self) -> bool {
        self.transactions_enabled.load(Ordering::SeqCst)
    }

    pub fn has_connection(&self) -> bool {
        self.managed.get().is_some()
    }

    /// A new proxy handle to the managed connection, if one was created
    pub fn connection(self: &Arc<Self>) -> Option<RollbackConnection<C>> {
        self.managed
            .get()
            .map(|managed| RollbackConnection::from_parts(self.clone(), managed.clone()))
    }

    pub(crate) fn managed(&self) -> Option<&Arc<ManagedConnection<C>>> {
        self.managed.get()
    }

    /// Install the managed connection. It is never replaced once set.
    pub(crate) fn install(&self, managed: Arc<ManagedConnection<C>>) -> bool {
        self.managed.set(managed).is_ok()
    }

    /// Flip the transaction flag.
    ///
    /// Disabling also forces auto-commit off on the managed connection right
    /// away, so no implicit commit slips in before the next intercepted call.
    pub fn set_transactions_enabled(&self, enabled: bool) -> Result<(), C::Error> {
        tracing::debug!(
            instance = %self.id,
            label = %self.label(),
            enabled,
            "Setting transactions enabled"
        );
        self.transactions_enabled.store(enabled, Ordering::SeqCst);

        if !enabled {
            if let Some(managed) = self.managed.get() {
                managed.lock().set_auto_commit(false)?;
            }
        }
        Ok(())
    }

    /// Disable transactions, then roll back the managed connection.
    ///
    /// Returns `false` when there was no connection to roll back.
    pub fn rollback(&self) -> Result<bool, C::Error> {
        self.transactions_enabled.store(false, Ordering::SeqCst);

        let Some(managed) = self.managed.get() else {
            tracing::debug!(instance = %self.id, "No managed connection, nothing to roll back");
            return Ok(false);
        };

        tracing::info!(instance = %self.id, label = %self.label(), "Rolling back managed connection");
        let mut connection = managed.lock();
        connection.set_auto_commit(false)?;
        connection.rollback()?;
        managed.reset_isolation(&mut connection)?;
        Ok(true)
    }

    /// Mark the instance as gone; the registry drops it on the next fan-out
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Type-erased view of an instance used by the registry
pub trait Coordinated: Send + Sync {
    fn id(&self) -> InstanceId;

    fn label(&self) -> String;

    fn is_disposed(&self) -> bool;

    fn apply(&self, signal: Signal) -> Result<(), BoxError>;
}

impl<C: Connection> Coordinated for InstanceState<C> {
    fn id(&self) -> InstanceId {
        self.id
    }

    fn label(&self) -> String {
        InstanceState::label(self)
    }

    fn is_disposed(&self) -> bool {
        InstanceState::is_disposed(self)
    }

    fn apply(&self, signal: Signal) -> Result<(), BoxError> {
        match signal {
            Signal::RollbackAll => self.rollback().map(|_| ())?,
            Signal::EnableTransactions => self.set_transactions_enabled(true)?,
            Signal::DisableTransactions => self.set_transactions_enabled(false)?,
        }
        Ok(())
    }
}

fn generate_label() -> String {
    let mut rng = rand::rng();
    format!("instance-{:08x}", rng.random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, StubConnection, StubProbe};

    fn managed_instance(probe: &StubProbe) -> Arc<InstanceState<StubConnection>> {
        let instance = InstanceState::new("test");
        let managed = ManagedConnection::new(StubConnection::new(probe), "ISOLATE");
        assert!(instance.install(Arc::new(managed)));
        instance
    }

    #[test]
    fn test_new_instance_defaults() {
        let instance = InstanceState::<StubConnection>::with_generated_label();
        assert!(instance.transactions_enabled());
        assert!(!instance.has_connection());
        assert!(instance.label().starts_with("instance-"));
    }

    #[test]
    fn test_managed_connection_is_never_replaced() {
        let probe = StubProbe::new();
        let instance = managed_instance(&probe);
        let second = ManagedConnection::new(StubConnection::new(&probe), "ISOLATE");
        assert!(!instance.install(Arc::new(second)));
    }

    #[test]
    fn test_disable_forces_auto_commit_off() {
        let probe = StubProbe::new();
        let instance = managed_instance(&probe);

        instance.set_transactions_enabled(false).unwrap();

        assert!(!instance.transactions_enabled());
        assert_eq!(probe.calls(), vec![Call::SetAutoCommit(false)]);
    }

    #[test]
    fn test_enable_does_not_touch_connection() {
        let probe = StubProbe::new();
        let instance = managed_instance(&probe);

        instance.set_transactions_enabled(true).unwrap();

        assert!(instance.transactions_enabled());
        assert!(probe.calls().is_empty());
    }

    #[test]
    fn test_rollback_freezes_then_rolls_back() {
        let probe = StubProbe::new();
        let instance = managed_instance(&probe);

        assert!(instance.rollback().unwrap());

        assert!(!instance.transactions_enabled());
        assert_eq!(
            probe.calls(),
            vec![
                Call::SetAutoCommit(false),
                Call::Rollback,
                Call::Execute("ISOLATE".to_string()),
            ]
        );
    }

    #[test]
    fn test_rollback_without_connection() {
        let instance = InstanceState::<StubConnection>::new("idle");
        assert!(!instance.rollback().unwrap());
        assert!(!instance.transactions_enabled());
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let probe = StubProbe::new();
        let instance = managed_instance(&probe);

        for signal in Signal::ALL {
            Coordinated::apply(instance.as_ref(), signal).unwrap();
            let once = instance.transactions_enabled();
            Coordinated::apply(instance.as_ref(), signal).unwrap();
            assert_eq!(instance.transactions_enabled(), once, "{signal}");
        }
    }

    #[test]
    fn test_failed_rollback_still_disables() {
        let probe = StubProbe::new();
        let instance = managed_instance(&probe);
        probe.fail_rollback(true);

        assert!(Coordinated::apply(instance.as_ref(), Signal::RollbackAll).is_err());
        assert!(!instance.transactions_enabled());
    }
}
