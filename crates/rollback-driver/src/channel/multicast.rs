//! Datagram broadcast over a UDP multicast group.
//!
//! The payload is the bare signal token. Senders fire one datagram and
//! return; delivery is best effort.

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Weak};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;

use rollback_common::constants::{MAX_DATAGRAM_SIZE, thread_names};
use rollback_common::{Signal, TransportError};

use super::listener::{ListenerHandle, spawn_listener};
use super::{ControlChannel, deliver};
use crate::config::MulticastTarget;
use crate::registry::CoordinationRegistry;

/// Sends signals to every process joined to one multicast group
#[derive(Debug, Clone)]
pub struct DatagramBroadcast {
    target: MulticastTarget,
}

impl DatagramBroadcast {
    pub fn new(target: MulticastTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> MulticastTarget {
        self.target
    }

    /// Join the group and start delivering received signals to `registry`
    pub fn start_listening(
        target: MulticastTarget,
        registry: &Arc<CoordinationRegistry>,
    ) -> Result<ListenerHandle, TransportError> {
        let registry = Arc::downgrade(registry);
        spawn_listener(
            thread_names::MULTICAST,
            move || {
                let socket = bind_socket(target)?;
                let addr = socket.local_addr()?;
                tracing::debug!(group = %target.ip(), port = target.port(), "Joined multicast group");
                Ok((UdpSocket::from_std(socket)?, addr))
            },
            move |socket, shutdown| receive_loop(socket, registry, shutdown),
        )
    }

    /// Listen on an already bound socket instead of joining a group
    pub fn start_listening_on(
        socket: std::net::UdpSocket,
        registry: &Arc<CoordinationRegistry>,
    ) -> Result<ListenerHandle, TransportError> {
        let registry = Arc::downgrade(registry);
        spawn_listener(
            thread_names::MULTICAST,
            move || {
                socket.set_nonblocking(true)?;
                let addr = socket.local_addr()?;
                Ok((UdpSocket::from_std(socket)?, addr))
            },
            move |socket, shutdown| receive_loop(socket, registry, shutdown),
        )
    }
}

#[async_trait]
impl ControlChannel for DatagramBroadcast {
    fn name(&self) -> &'static str {
        "multicast"
    }

    async fn send(&self, signal: Signal) -> Result<(), TransportError> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|source| TransportError::Io {
                action: "binding datagram sender",
                source,
            })?;
        socket
            .set_multicast_loop_v4(true)
            .map_err(|source| TransportError::Io {
                action: "enabling multicast loopback",
                source,
            })?;

        let sent = socket
            .send_to(signal.token().as_bytes(), self.target)
            .await
            .map_err(|source| TransportError::Io {
                action: "sending datagram",
                source,
            })?;

        tracing::debug!(signal = %signal, target = %self.target, bytes = sent, "Datagram sent");
        Ok(())
    }
}

/// Bind the group port on all interfaces and join the group.
///
/// Several processes on one host may listen on the same group port.
pub fn bind_socket(target: MulticastTarget) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, target.port());
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(target.ip(), &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

async fn receive_loop(
    socket: UdpSocket,
    registry: Weak<CoordinationRegistry>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<(), TransportError> {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, peer) = result.map_err(|source| TransportError::Io {
                    action: "receiving datagram",
                    source,
                })?;
                if !handle_datagram(&buf[..len], peer, &registry) {
                    return Ok(());
                }
            }
            _ = &mut shutdown => return Ok(()),
        }
    }
}

fn handle_datagram(payload: &[u8], peer: SocketAddr, registry: &Weak<CoordinationRegistry>) -> bool {
    match Signal::from_payload(payload) {
        Ok(signal) => deliver(registry, signal, peer),
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Discarding malformed datagram");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ListenerState;
    use crate::instance::{InstanceState, ManagedConnection};
    use crate::testing::{Call, StubConnection, StubProbe};
    use std::time::Duration;

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    fn loopback_listener(
        registry: &Arc<CoordinationRegistry>,
    ) -> (ListenerHandle, DatagramBroadcast) {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let handle = DatagramBroadcast::start_listening_on(socket, registry).unwrap();
        let SocketAddr::V4(addr) = handle.local_addr() else {
            panic!("expected an IPv4 listener");
        };
        (handle, DatagramBroadcast::new(addr))
    }

    fn registered(registry: &CoordinationRegistry) -> (Arc<InstanceState<StubConnection>>, StubProbe) {
        let probe = StubProbe::new();
        let instance = InstanceState::new("datagram-test");
        instance.install(Arc::new(ManagedConnection::new(
            StubConnection::new(&probe),
            "ISOLATE",
        )));
        registry.register(&instance);
        (instance, probe)
    }

    #[tokio::test]
    async fn test_rollback_datagram_rolls_back_once() {
        let registry = CoordinationRegistry::new();
        let (instance, probe) = registered(&registry);
        let (_handle, sender) = loopback_listener(&registry);

        sender.send(Signal::RollbackAll).await.unwrap();

        assert!(wait_until(|| probe.count(&Call::Rollback) == 1).await);
        assert!(!instance.transactions_enabled());
    }

    #[tokio::test]
    async fn test_garbage_is_discarded_and_listener_survives() {
        let registry = CoordinationRegistry::new();
        let (instance, probe) = registered(&registry);
        let (handle, sender) = loopback_listener(&registry);

        let raw = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(b"garbage", handle.local_addr()).unwrap();
        raw.send_to(&[0xff, 0xfe], handle.local_addr()).unwrap();

        sender.send(Signal::DisableTransactions).await.unwrap();
        assert!(wait_until(|| !instance.transactions_enabled()).await);
        assert_eq!(probe.count(&Call::Rollback), 0);
        assert_eq!(handle.state(), ListenerState::Listening);

        raw.send_to(b"allowTransactions\n", handle.local_addr()).unwrap();
        assert!(wait_until(|| instance.transactions_enabled()).await);
    }

    fn free_udp_port() -> u16 {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_group_members_share_one_port() {
        let target = SocketAddrV4::new(Ipv4Addr::new(228, 0, 0, 77), free_udp_port());
        let transport = crate::config::Transport::Multicast(target);

        let first = CoordinationRegistry::new();
        let second = CoordinationRegistry::new();
        let (a, probe_a) = registered(&first);
        let (b, probe_b) = registered(&second);

        let addr = first.ensure_listener(&transport).unwrap().unwrap();
        assert_eq!(addr.port(), target.port());
        assert_eq!(
            second.ensure_listener(&transport).unwrap().unwrap().port(),
            target.port()
        );

        DatagramBroadcast::new(target)
            .send(Signal::RollbackAll)
            .await
            .unwrap();

        assert!(wait_until(|| probe_a.count(&Call::Rollback) == 1).await);
        assert!(wait_until(|| probe_b.count(&Call::Rollback) == 1).await);
        assert!(!a.transactions_enabled());
        assert!(!b.transactions_enabled());

        first.stop_listener();
        second.stop_listener();
    }

    #[tokio::test]
    async fn test_stop_listener() {
        let registry = CoordinationRegistry::new();
        let (mut handle, _) = loopback_listener(&registry);

        handle.stop();
        assert_eq!(handle.state(), ListenerState::Stopped);
    }

    #[test]
    fn test_listener_ends_when_registry_is_dropped() {
        let registry = CoordinationRegistry::new();
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let handle = DatagramBroadcast::start_listening_on(socket, &registry).unwrap();
        drop(registry);

        let raw = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(b"ROLLBACK", handle.local_addr()).unwrap();

        let mut state = handle.subscribe();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            tokio::time::timeout(
                Duration::from_secs(5),
                state.wait_for(|s| *s == ListenerState::Stopped),
            )
            .await
            .unwrap()
            .unwrap();
        });
    }
}
