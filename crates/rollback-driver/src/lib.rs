//! # Rollback Driver
//!
//! Lets integration tests run destructive database work against a shared
//! database and undo it afterwards, even when the application under test
//! holds connections from several independent instances.
//!
//! ## Architecture
//! ```text
//! ControlClient ──send──▶ ControlChannel ──(local | multicast | socket)──▶ listener
//!                                                                          │
//!                              CoordinationRegistry ◀──────apply_signal────┘
//!                                       │ fan-out
//!                  InstanceState ... InstanceState
//!                        │                 │
//!               RollbackConnection   RollbackConnection   (commit/rollback/close interception)
//! ```
//!
//! ## Modules
//! - `connection` - Capability set required from the wrapped driver
//! - `proxy` - Per-call interception of commit/rollback/close
//! - `instance` - Per-instance transaction flag and managed connection
//! - `registry` - Process-wide fan-out table
//! - `channel` - Local, multicast and point-to-point transports
//! - `client` - Facade issuing the three control signals
//! - `driver` - Coordinating instance that owns one managed connection
//! - `config` - Transport selection from file and environment
//! - `sqlite` - SQLite implementation of the driver interface (feature `sqlite`)
//! - `testing` - Recording stub driver for test suites (feature `testing`)

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod driver;
pub mod instance;
pub mod proxy;
pub mod registry;
#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use channel::{
    ControlChannel, DatagramBroadcast, ListenerHandle, ListenerState, LocalBroadcast,
    PointToPointChannel,
};
pub use client::ControlClient;
pub use config::{ChannelConfig, MulticastTarget, SocketTarget, Transport};
pub use connection::{Connection, Credentials, Driver};
pub use driver::RollbackDriver;
pub use instance::{Coordinated, InstanceState};
pub use proxy::{Action, Intercept, RollbackConnection};
pub use registry::{ApplyReport, CoordinationRegistry, RegistrationHandle};
pub use rollback_common::{
    ChannelMode, ConfigError, InstanceFailure, InstanceId, ProtocolError, Signal, TransportError,
};
