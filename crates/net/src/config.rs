//! Hub and link settings
//!
//! Both structs deserialize from partial TOML/JSON tables; missing keys
//! take the defaults below.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frame::DEFAULT_MAX_LINE_BYTES;
use crate::DEFAULT_PORT;

/// Server-side settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HubConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub max_line_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl HubConfig {
    /// Loopback hub on an OS-assigned port
    pub fn ephemeral() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..Self::default()
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

/// Client-side settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    /// Wait between failed connect attempts
    pub retry_interval_ms: u64,
    pub max_line_bytes: usize,
    /// Buffered events per subscriber before the slowest one lags
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            retry_interval_ms: 3000,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            event_capacity: 256,
        }
    }
}

impl LinkConfig {
    pub fn for_addr(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..Self::default()
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// `host:port` as passed to the connector
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
