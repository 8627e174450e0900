//! Remote control facade used by test harnesses and the CLI.

use std::sync::Arc;

use rollback_common::{Signal, TransportError};

use crate::channel::{ControlChannel, DatagramBroadcast, LocalBroadcast, PointToPointChannel};
use crate::config::{ChannelConfig, Transport};
use crate::registry::CoordinationRegistry;

/// Broadcasts control signals over the configured transport
pub struct ControlClient {
    channel: Box<dyn ControlChannel>,
}

impl ControlClient {
    /// Client for whatever transport `config` resolves to
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::for_transport(&config.resolve())
    }

    /// Client for the process-wide configuration
    pub fn from_env() -> Self {
        Self::from_config(ChannelConfig::global())
    }

    pub fn for_transport(transport: &Transport) -> Self {
        match transport {
            Transport::Local => Self::with_channel(LocalBroadcast::new()),
            Transport::Multicast(target) => Self::with_channel(DatagramBroadcast::new(*target)),
            Transport::PointToPoint(target) => {
                Self::with_channel(PointToPointChannel::new(target.clone()))
            }
        }
    }

    /// Local-only client bound to a specific registry
    pub fn local(registry: Arc<CoordinationRegistry>) -> Self {
        Self::with_channel(LocalBroadcast::with_registry(registry))
    }

    pub fn with_channel(channel: impl ControlChannel + 'static) -> Self {
        Self {
            channel: Box::new(channel),
        }
    }

    pub fn channel_name(&self) -> &'static str {
        self.channel.name()
    }

    /// Disable transactions everywhere and roll back every managed connection
    pub async fn rollback_all(&self) -> Result<(), TransportError> {
        self.send(Signal::RollbackAll).await
    }

    pub async fn enable_transactions(&self) -> Result<(), TransportError> {
        self.send(Signal::EnableTransactions).await
    }

    pub async fn disable_transactions(&self) -> Result<(), TransportError> {
        self.send(Signal::DisableTransactions).await
    }

    pub async fn send(&self, signal: Signal) -> Result<(), TransportError> {
        tracing::debug!(signal = %signal, channel = self.channel.name(), "Sending signal");
        self.channel.send(signal).await.inspect_err(|e| {
            tracing::warn!(
                signal = %signal,
                channel = self.channel.name(),
                error = %e,
                "Failed to send signal"
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocketTarget;
    use crate::instance::{InstanceState, ManagedConnection};
    use crate::testing::{StubConnection, StubProbe};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rollback_common::ChannelMode;

    #[derive(Default, Clone)]
    struct Recording {
        sent: Arc<Mutex<Vec<Signal>>>,
    }

    #[async_trait]
    impl ControlChannel for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, signal: Signal) -> Result<(), TransportError> {
            self.sent.lock().push(signal);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_operations_map_to_signals() {
        let recording = Recording::default();
        let client = ControlClient::with_channel(recording.clone());

        client.disable_transactions().await.unwrap();
        client.enable_transactions().await.unwrap();
        client.rollback_all().await.unwrap();

        assert_eq!(
            *recording.sent.lock(),
            vec![
                Signal::DisableTransactions,
                Signal::EnableTransactions,
                Signal::RollbackAll
            ]
        );
    }

    #[test]
    fn test_channel_follows_config() {
        assert_eq!(
            ControlClient::from_config(&ChannelConfig::default()).channel_name(),
            "local"
        );

        let config = ChannelConfig {
            mode: ChannelMode::PointToPoint,
            ..Default::default()
        };
        assert_eq!(ControlClient::from_config(&config).channel_name(), "point_to_point");

        let client = ControlClient::for_transport(&Transport::PointToPoint(SocketTarget {
            host: "db-host".to_string(),
            port: 9000,
        }));
        assert_eq!(client.channel_name(), "point_to_point");
    }

    #[tokio::test]
    async fn test_local_client_drives_registry() {
        let registry = CoordinationRegistry::new();
        let probe = StubProbe::new();
        let instance = InstanceState::new("client-test");
        instance.install(Arc::new(ManagedConnection::new(
            StubConnection::new(&probe),
            "ISOLATE",
        )));
        registry.register(&instance);

        let client = ControlClient::local(registry);
        client.disable_transactions().await.unwrap();
        assert!(!instance.transactions_enabled());

        client.enable_transactions().await.unwrap();
        assert!(instance.transactions_enabled());
    }
}
