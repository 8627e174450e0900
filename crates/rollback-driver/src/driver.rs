//! Coordinating instance.
//!
//! A `RollbackDriver` wraps a real [`Driver`], owns one [`InstanceState`]
//! and hands out the single managed connection of that instance. The first
//! `connect` registers the instance and brings up the remote listener of the
//! process, if one is configured.

use parking_lot::Mutex;
use std::sync::Arc;

use rollback_common::constants::LABEL_SEPARATOR;

use crate::config::{ChannelConfig, Transport};
use crate::connection::{Connection, Credentials, Driver};
use crate::instance::InstanceState;
use crate::proxy::RollbackConnection;
use crate::registry::{CoordinationRegistry, RegistrationHandle};

type DriverError<D> = <<D as Driver>::Connection as Connection>::Error;

pub struct RollbackDriver<D: Driver> {
    driver: D,
    instance: Arc<InstanceState<D::Connection>>,
    registry: Arc<CoordinationRegistry>,
    transport: Transport,
    registration: Mutex<Option<RegistrationHandle>>,
    connect_lock: Mutex<()>,
}

impl<D: Driver> RollbackDriver<D> {
    /// Coordinate through the process-wide registry and configuration
    pub fn new(driver: D) -> Self {
        Self::with_registry(
            driver,
            CoordinationRegistry::global(),
            ChannelConfig::global().resolve(),
        )
    }

    pub fn with_registry(
        driver: D,
        registry: Arc<CoordinationRegistry>,
        transport: Transport,
    ) -> Self {
        Self {
            driver,
            instance: InstanceState::with_generated_label(),
            registry,
            transport,
            registration: Mutex::new(None),
            connect_lock: Mutex::new(()),
        }
    }

    pub fn instance(&self) -> &Arc<InstanceState<D::Connection>> {
        &self.instance
    }

    pub fn registry(&self) -> &Arc<CoordinationRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Open (once) and return the managed connection of this instance.
    ///
    /// A `label#` prefix on the DSN renames the instance and is stripped
    /// before the DSN reaches the wrapped driver. Listener start-up failures
    /// are logged; coordination then only works in-process.
    pub fn connect(
        &self,
        dsn: &str,
        credentials: &Credentials,
    ) -> Result<RollbackConnection<D::Connection>, DriverError<D>> {
        let dsn = match split_label(dsn) {
            (Some(label), rest) => {
                self.instance.set_label(label);
                rest
            }
            (None, rest) => rest,
        };

        self.register();

        if let Err(e) = self.registry.ensure_listener(&self.transport) {
            tracing::warn!(
                instance = %self.instance.id(),
                error = %e,
                "Failed to start signal listener, remote signals will not reach this process"
            );
        }

        let _guard = self.connect_lock.lock();
        if let Some(connection) = self.instance.connection() {
            return Ok(connection);
        }

        let raw = self.driver.connect(dsn, credentials)?;
        let connection =
            RollbackConnection::wrap(self.instance.clone(), raw, self.driver.isolation_statement())?;

        tracing::info!(
            instance = %self.instance.id(),
            label = %self.instance.label(),
            "Managed connection created"
        );
        Ok(connection)
    }

    fn register(&self) {
        let mut registration = self.registration.lock();
        if registration.is_none() {
            *registration = Some(self.registry.register(&self.instance));
        }
    }
}

impl<D: Driver> Drop for RollbackDriver<D> {
    fn drop(&mut self) {
        self.instance.dispose();
        if let Some(handle) = self.registration.get_mut().take() {
            self.registry.unregister(handle);
        }
    }
}

/// Split `label#dsn` into its parts. An empty label is ignored.
fn split_label(dsn: &str) -> (Option<&str>, &str) {
    match dsn.split_once(LABEL_SEPARATOR) {
        Some((label, rest)) if !label.is_empty() => (Some(label), rest),
        Some(("", rest)) => (None, rest),
        _ => (None, dsn),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, StubDriver, StubProbe};
    use rollback_common::Signal;
    use rollback_common::constants::READ_UNCOMMITTED_STATEMENT;

    fn driver(probe: &StubProbe) -> (RollbackDriver<StubDriver>, Arc<CoordinationRegistry>) {
        let registry = CoordinationRegistry::new();
        let driver =
            RollbackDriver::with_registry(StubDriver::new(probe), registry.clone(), Transport::Local);
        (driver, registry)
    }

    #[test]
    fn test_split_label() {
        assert_eq!(split_label("orders#jdbc:h2:mem"), (Some("orders"), "jdbc:h2:mem"));
        assert_eq!(split_label("#jdbc:h2:mem"), (None, "jdbc:h2:mem"));
        assert_eq!(split_label("jdbc:h2:mem"), (None, "jdbc:h2:mem"));
    }

    #[test]
    fn test_connect_creates_one_managed_connection() {
        let probe = StubProbe::new();
        let (driver, registry) = driver(&probe);

        let mut first = driver.connect("orders#db", &Credentials::none()).unwrap();
        let _second = driver.connect("db", &Credentials::new("sa", "")).unwrap();

        assert_eq!(probe.connects(), 1);
        assert_eq!(driver.instance().label(), "orders");
        assert_eq!(registry.len(), 1);
        assert_eq!(
            probe.calls(),
            vec![
                Call::SetAutoCommit(false),
                Call::Execute(READ_UNCOMMITTED_STATEMENT.to_string())
            ]
        );

        first.close().unwrap();
        assert_eq!(probe.count(&Call::Close), 0);
    }

    #[test]
    fn test_failed_connect_can_be_retried() {
        let probe = StubProbe::new();
        let (driver, registry) = driver(&probe);

        probe.fail_connect(true);
        assert!(driver.connect("db", &Credentials::none()).is_err());
        assert!(!driver.instance().has_connection());

        probe.fail_connect(false);
        driver.connect("db", &Credentials::none()).unwrap();
        assert!(driver.instance().has_connection());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_signals_reach_driver_connection() {
        let probe = StubProbe::new();
        let (driver, registry) = driver(&probe);
        let mut connection = driver.connect("db", &Credentials::none()).unwrap();
        probe.clear();

        registry.apply_signal(Signal::DisableTransactions);
        connection.commit().unwrap();
        assert_eq!(probe.count(&Call::Commit), 0);

        registry.apply_signal(Signal::RollbackAll);
        assert_eq!(probe.count(&Call::Rollback), 1);
    }

    #[test]
    fn test_drop_unregisters() {
        let probe = StubProbe::new();
        let (driver, registry) = driver(&probe);
        driver.connect("db", &Credentials::none()).unwrap();
        let instance = driver.instance().clone();

        drop(driver);

        assert!(instance.is_disposed());
        assert!(registry.is_empty());
    }
}
