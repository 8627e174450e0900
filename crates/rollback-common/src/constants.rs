//! Shared constants for rollback components.

/// Default host the point-to-point client connects to
pub const DEFAULT_SOCKET_HOST: &str = "localhost";

/// Port used by the point-to-point listener when the mode is forced but no port is set
pub const DEFAULT_SOCKET_PORT: u16 = 3333;

/// Port used by the multicast listener when the mode is forced but no port is set
pub const DEFAULT_MULTICAST_PORT: u16 = 4444;

/// First octet substituted into the host address to derive a multicast group
pub const MULTICAST_FIRST_OCTET: u8 = 228;

/// Receive buffer for a single control datagram
pub const MAX_DATAGRAM_SIZE: usize = 256;

/// Largest point-to-point frame accepted by the listener
pub const MAX_FRAME_LEN: usize = 256;

/// Point-to-point client connect timeout (seconds)
pub const SOCKET_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Point-to-point listener read timeout per accepted connection (seconds)
pub const SOCKET_READ_TIMEOUT_SECS: u64 = 5;

/// Session isolation statement re-issued after every real commit/rollback
pub const READ_UNCOMMITTED_STATEMENT: &str = "SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED";

/// Environment variable prefix for channel configuration (`ROLLBACK_MODE`, ...)
pub const ENV_PREFIX: &str = "ROLLBACK";

/// Separates a diagnostic label from the DSN: `webapp1#sqlite:/tmp/app.db`
pub const LABEL_SEPARATOR: char = '#';

/// Wire tokens, identical for the datagram and point-to-point transports
pub mod tokens {
    pub const ROLLBACK: &str = "ROLLBACK";

    pub const ALLOW_TRANSACTIONS: &str = "allowTransactions";

    pub const DISABLE_TRANSACTIONS: &str = "disableTransactions";

    /// Older socket clients sent this instead of `ROLLBACK`
    pub const LEGACY_ROLLBACK_ALL: &str = "rollbackAll";
}

/// Names of the background listener threads
pub mod thread_names {
    pub const MULTICAST: &str = "rollback-multicast";

    pub const SOCKET: &str = "rollback-socket";
}
