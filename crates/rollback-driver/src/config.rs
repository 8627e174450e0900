//! Channel configuration.
//!
//! Loaded once per process from an optional config file and `ROLLBACK_*`
//! environment variables. Each transport reads only its own keys:
//!
//! ```text
//! ROLLBACK_MODE=none|local|multicast|point_to_point
//! ROLLBACK_MULTICAST__GROUP=228.10.0.12
//! ROLLBACK_MULTICAST__PORT=4444
//! ROLLBACK_SOCKET__HOST=localhost
//! ROLLBACK_SOCKET__PORT=3333
//! ```

use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::sync::OnceLock;

use rollback_common::constants::{
    DEFAULT_MULTICAST_PORT, DEFAULT_SOCKET_HOST, DEFAULT_SOCKET_PORT, ENV_PREFIX,
    MULTICAST_FIRST_OCTET,
};
use rollback_common::{ChannelMode, ConfigError};

/// Raw channel configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelConfig {
    /// Explicit transport selection (`none` = infer from ports)
    #[serde(default)]
    pub mode: ChannelMode,

    #[serde(default)]
    pub multicast: MulticastConfig,

    #[serde(default)]
    pub socket: SocketConfig,
}

/// Datagram transport settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MulticastConfig {
    /// Group address; derived from the host address when unset
    #[serde(default)]
    pub group: Option<Ipv4Addr>,

    /// 0 = not configured
    #[serde(default)]
    pub port: u16,
}

/// Point-to-point transport settings
#[derive(Debug, Clone, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_socket_host")]
    pub host: String,

    /// 0 = not configured
    #[serde(default)]
    pub port: u16,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            host: default_socket_host(),
            port: 0,
        }
    }
}

fn default_socket_host() -> String {
    DEFAULT_SOCKET_HOST.to_string()
}

/// Where multicast signals are sent and received
pub type MulticastTarget = SocketAddrV4;

/// Where point-to-point signals are sent; the listener binds `port` on all interfaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketTarget {
    pub host: String,
    pub port: u16,
}

/// The one transport this process uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Local,
    Multicast(MulticastTarget),
    PointToPoint(SocketTarget),
}

impl ChannelConfig {
    /// Load from an optional file, then `ROLLBACK_*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    /// Like [`load`](Self::load), reading `ROLLBACK_*` variables from `env`
    /// instead of the process environment when given
    pub fn load_with_env(
        path: Option<&str>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if Path::new(path).exists() {
                builder = builder.add_source(config::File::with_name(path));
            } else {
                tracing::warn!(path = %path, "Config file not found, using environment only");
            }
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| ConfigError::Load(e.to_string()))
    }

    /// Load from the environment, degrading to defaults on error
    pub fn from_env() -> Self {
        Self::load(None).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Invalid rollback configuration, using local-only coordination");
            Self::default()
        })
    }

    /// The configuration resolved once for this process
    pub fn global() -> &'static ChannelConfig {
        static GLOBAL: OnceLock<ChannelConfig> = OnceLock::new();
        GLOBAL.get_or_init(Self::from_env)
    }

    /// The mode actually in effect: explicit, or inferred with
    /// point-to-point > multicast > local priority
    pub fn effective_mode(&self) -> ChannelMode {
        match self.mode {
            ChannelMode::None if self.socket.port > 0 => ChannelMode::PointToPoint,
            ChannelMode::None if self.multicast.port > 0 => ChannelMode::Multicast,
            ChannelMode::None => ChannelMode::Local,
            mode => mode,
        }
    }

    /// Pick the transport. Never fails: an unresolvable remote transport
    /// falls back to local-only.
    pub fn resolve(&self) -> Transport {
        match self.effective_mode() {
            ChannelMode::None | ChannelMode::Local => Transport::Local,
            ChannelMode::PointToPoint => Transport::PointToPoint(SocketTarget {
                host: self.socket.host.clone(),
                port: non_zero_or(self.socket.port, DEFAULT_SOCKET_PORT),
            }),
            ChannelMode::Multicast => match self.multicast_group() {
                Ok(group) => Transport::Multicast(SocketAddrV4::new(
                    group,
                    non_zero_or(self.multicast.port, DEFAULT_MULTICAST_PORT),
                )),
                Err(e) => {
                    tracing::warn!(error = %e, "Multicast disabled, falling back to local-only coordination");
                    Transport::Local
                }
            },
        }
    }

    fn multicast_group(&self) -> Result<Ipv4Addr, ConfigError> {
        let group = match self.multicast.group {
            Some(group) => group,
            None => derive_multicast_group().ok_or(ConfigError::NoMulticastGroup)?,
        };
        if !group.is_multicast() {
            return Err(ConfigError::NotMulticast(group));
        }
        Ok(group)
    }
}

fn non_zero_or(port: u16, default: u16) -> u16 {
    if port == 0 { default } else { port }
}

/// Derive a group from the first non-loopback IPv4 address of this host by
/// replacing its first octet: `10.0.4.17` becomes `228.0.4.17`.
pub fn derive_multicast_group() -> Option<Ipv4Addr> {
    let interfaces = match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to list network interfaces");
            return None;
        }
    };

    interfaces
        .iter()
        .filter(|iface| !iface.is_loopback())
        .find_map(|iface| match iface.ip() {
            std::net::IpAddr::V4(ip) => Some(multicast_group_for(ip)),
            std::net::IpAddr::V6(_) => None,
        })
}

fn multicast_group_for(host: Ipv4Addr) -> Ipv4Addr {
    let [_, b, c, d] = host.octets();
    Ipv4Addr::new(MULTICAST_FIRST_OCTET, b, c, d)
}
