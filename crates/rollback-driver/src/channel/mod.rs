//! Control channels.
//!
//! Implements:
//! - Local fan-out through the process-wide registry
//! - Datagram broadcast (UDP multicast group)
//! - Point-to-point (one TCP listener per host, fire-and-forget clients)

mod listener;
mod local;
mod multicast;
mod socket;

pub use listener::{ListenerHandle, ListenerState};
pub use local::LocalBroadcast;
pub use multicast::DatagramBroadcast;
pub use socket::PointToPointChannel;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Weak;

use rollback_common::{Signal, TransportError};

use crate::registry::CoordinationRegistry;

/// "Notify every instance of signal S"
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    async fn send(&self, signal: Signal) -> Result<(), TransportError>;
}

/// Hand a received signal to the registry.
///
/// Returns `false` once the registry is gone, which ends the listener.
pub(crate) fn deliver(
    registry: &Weak<CoordinationRegistry>,
    signal: Signal,
    peer: SocketAddr,
) -> bool {
    let Some(registry) = registry.upgrade() else {
        tracing::info!("Registry dropped, listener has nothing left to deliver to");
        return false;
    };

    tracing::debug!(signal = %signal, peer = %peer, "Signal received");
    let report = registry.apply_signal(signal);
    if !report.is_ok() {
        tracing::warn!(
            signal = %signal,
            failed = report.failures.len(),
            total = report.total(),
            "Signal applied with failures"
        );
    }
    true
}
