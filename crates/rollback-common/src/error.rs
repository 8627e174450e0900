//! Error types for the coordination layer.
//!
//! Errors raised by the wrapped database driver are not represented here:
//! they pass through the interception proxy with their own type.

use std::io;
use std::net::Ipv4Addr;
use thiserror::Error;

use crate::types::{InstanceId, Signal};

/// Malformed payload received by a listener. The message is discarded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown signal token: {0:?}")]
    UnknownToken(String),

    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("Frame length {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Connection closed before a complete frame was read")]
    Truncated,
}

/// One instance that could not apply a signal
#[derive(Debug, Clone, Error)]
#[error("instance {label} ({instance}) failed to apply {signal}: {message}")]
pub struct InstanceFailure {
    pub instance: InstanceId,
    pub label: String,
    pub signal: Signal,
    pub message: String,
}

/// A signal could not be delivered or applied
#[derive(Debug, Error)]
pub enum TransportError {
    /// Remote listener unreachable
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Socket-level failure
    #[error("I/O error while {action}: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Timed out while {0}")]
    Timeout(&'static str),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The signal reached this process but some instances failed to apply it
    #[error("{} of {total} instance(s) failed to apply {signal}", .failures.len())]
    InstancesFailed {
        signal: Signal,
        total: usize,
        failures: Vec<InstanceFailure>,
    },
}

impl TransportError {
    /// Returns true if sending again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Io { .. } | Self::Timeout(_))
    }
}

/// Configuration that cannot be resolved. The affected transport is
/// disabled and coordination falls back to local-only.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("No multicast group configured and none could be derived from the host interfaces")]
    NoMulticastGroup,

    #[error("{0} is not an IPv4 multicast address")]
    NotMulticast(Ipv4Addr),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_failed_message() {
        let err = TransportError::InstancesFailed {
            signal: Signal::RollbackAll,
            total: 3,
            failures: vec![InstanceFailure {
                instance: InstanceId::next(),
                label: "webapp2".to_string(),
                signal: Signal::RollbackAll,
                message: "session is dead".to_string(),
            }],
        };
        assert_eq!(err.to_string(), "1 of 3 instance(s) failed to apply ROLLBACK");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable() {
        assert!(TransportError::Timeout("connecting").is_retryable());
        assert!(!TransportError::Protocol(ProtocolError::InvalidUtf8).is_retryable());
    }
}
