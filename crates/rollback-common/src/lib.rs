//! # Rollback Common
//!
//! Shared types and constants used by the rollback driver and its control CLI.
//!
//! ## Modules
//! - `types` - Control signals, channel modes, instance identifiers
//! - `error` - Protocol, transport and configuration errors
//! - `constants` - Wire tokens and default ports

pub mod constants;
pub mod error;
pub mod types;

pub use error::{ConfigError, InstanceFailure, ProtocolError, TransportError};
pub use types::*;
