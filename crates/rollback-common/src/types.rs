//! Core types shared across rollback components.

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::constants::tokens;
use crate::error::ProtocolError;

/// Control signal fanned out to every coordinating instance.
///
/// Signals carry no payload and are idempotent: applying one twice leaves an
/// instance in the same state as applying it once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Freeze commits, then roll back every managed connection
    RollbackAll,
    /// Let commit/rollback reach the database again
    EnableTransactions,
    /// Swallow commit/rollback so nothing becomes durable
    DisableTransactions,
}

impl Signal {
    pub const ALL: [Signal; 3] = [
        Signal::RollbackAll,
        Signal::EnableTransactions,
        Signal::DisableTransactions,
    ];

    /// The ASCII token carried on the wire
    pub fn token(&self) -> &'static str {
        match self {
            Self::RollbackAll => tokens::ROLLBACK,
            Self::EnableTransactions => tokens::ALLOW_TRANSACTIONS,
            Self::DisableTransactions => tokens::DISABLE_TRANSACTIONS,
        }
    }

    /// Map a wire token back to a signal. Surrounding whitespace is ignored.
    pub fn from_token(token: &str) -> Result<Self, ProtocolError> {
        match token.trim() {
            tokens::ROLLBACK | tokens::LEGACY_ROLLBACK_ALL => Ok(Self::RollbackAll),
            tokens::ALLOW_TRANSACTIONS => Ok(Self::EnableTransactions),
            tokens::DISABLE_TRANSACTIONS => Ok(Self::DisableTransactions),
            other => Err(ProtocolError::UnknownToken(other.to_string())),
        }
    }

    /// Decode a raw datagram or frame payload
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        let token = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;
        Self::from_token(token)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Signal {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_token(s)
    }
}

/// Transport selection read from configuration.
///
/// `None` means nothing was selected explicitly; the transport is then
/// inferred from which port is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    #[default]
    None,
    #[serde(alias = "local_only")]
    Local,
    Multicast,
    #[serde(alias = "socket")]
    PointToPoint,
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Local => "local",
            Self::Multicast => "multicast",
            Self::PointToPoint => "point_to_point",
        };
        f.write_str(name)
    }
}

/// Opaque identity of a coordinating instance, stable for its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}
