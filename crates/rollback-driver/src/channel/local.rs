//! In-process fan-out.

use async_trait::async_trait;
use std::sync::{Arc, OnceLock};

use rollback_common::{Signal, TransportError};

use super::ControlChannel;
use crate::registry::CoordinationRegistry;

/// Delivers signals to every instance registered in this process
#[derive(Default)]
pub struct LocalBroadcast {
    registry: OnceLock<Arc<CoordinationRegistry>>,
}

impl LocalBroadcast {
    /// Broadcast through the process-wide registry, resolved on first send
    pub fn new() -> Self {
        Self::default()
    }

    /// Broadcast through a specific registry
    pub fn with_registry(registry: Arc<CoordinationRegistry>) -> Self {
        let channel = Self::default();
        let _ = channel.registry.set(registry);
        channel
    }

    fn registry(&self) -> &Arc<CoordinationRegistry> {
        self.registry.get_or_init(CoordinationRegistry::global)
    }
}

#[async_trait]
impl ControlChannel for LocalBroadcast {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn send(&self, signal: Signal) -> Result<(), TransportError> {
        let applied = self.registry().apply_signal(signal).into_result()?;
        tracing::debug!(signal = %signal, instances = applied, "Local broadcast delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{InstanceState, ManagedConnection};
    use crate::testing::{Call, StubConnection, StubProbe};

    fn instance(registry: &CoordinationRegistry) -> (Arc<InstanceState<StubConnection>>, StubProbe) {
        let probe = StubProbe::new();
        let instance = InstanceState::new("local-test");
        instance.install(Arc::new(ManagedConnection::new(
            StubConnection::new(&probe),
            "ISOLATE",
        )));
        registry.register(&instance);
        (instance, probe)
    }

    #[tokio::test]
    async fn test_local_broadcast_reaches_every_instance() {
        let registry = CoordinationRegistry::new();
        let (a, _) = instance(&registry);
        let (b, probe_b) = instance(&registry);
        let channel = LocalBroadcast::with_registry(registry.clone());

        channel.send(Signal::DisableTransactions).await.unwrap();
        assert!(!a.transactions_enabled());
        assert!(!b.transactions_enabled());

        channel.send(Signal::EnableTransactions).await.unwrap();
        assert!(a.transactions_enabled());

        channel.send(Signal::RollbackAll).await.unwrap();
        assert_eq!(probe_b.count(&Call::Rollback), 1);
        assert!(!b.transactions_enabled());
    }

    #[tokio::test]
    async fn test_local_broadcast_reports_failures() {
        let registry = CoordinationRegistry::new();
        let (_a, probe_a) = instance(&registry);
        let (_b, probe_b) = instance(&registry);
        probe_a.fail_rollback(true);

        let channel = LocalBroadcast::with_registry(registry);
        let err = channel.send(Signal::RollbackAll).await.unwrap_err();

        assert!(matches!(err, TransportError::InstancesFailed { total: 2, .. }));
        assert!(!err.is_retryable());
        assert_eq!(probe_b.count(&Call::Rollback), 1);
    }

    #[tokio::test]
    async fn test_empty_registry_is_ok() {
        let channel = LocalBroadcast::with_registry(CoordinationRegistry::new());
        assert_eq!(channel.name(), "local");
        tokio_test::assert_ok!(channel.send(Signal::RollbackAll).await);
    }
}
