//! Transport destination addresses

use std::fmt;
use std::net::SocketAddr;

use sipflow_sip_core::{host_ip, join_host_port, split_host_port, TransportKind};
use crate::error::{Error, Result};
use crate::resolver::Resolver;

/// Host used when a target leaves it empty
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// A `host[:port]` a protocol listens on or sends to.
///
/// The host keeps IPv6 brackets so the target formats back to a valid
/// `host:port` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: Option<u16>,
}

impl Target {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Target {
            host: host.into(),
            port,
        }
    }

    /// Parse `host[:port]`
    pub fn from_addr(addr: &str) -> Result<Self> {
        let (host, port) =
            split_host_port(addr).map_err(|e| Error::InvalidTarget(format!("{}: {}", addr, e)))?;
        Ok(Target { host, port })
    }

    /// Fill an empty host and a missing port with the transport defaults
    pub fn fill_defaults(mut self, network: TransportKind) -> Self {
        if self.host.is_empty() {
            self.host = DEFAULT_HOST.to_string();
        }
        if self.port.is_none() {
            self.port = Some(network.default_port());
        }
        self
    }

    /// True when the host is an IP literal and needs no lookup
    pub fn is_ip(&self) -> bool {
        host_ip(&self.host).is_some()
    }

    /// Host with IPv6 brackets removed
    pub fn bare_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// Resolve to a socket address through `resolver`; the port must
    /// already be set. IP literals skip the lookup.
    pub async fn resolve(&self, resolver: &dyn Resolver) -> Result<SocketAddr> {
        let port = self
            .port
            .ok_or_else(|| Error::InvalidTarget(format!("{} has no port", self.host)))?;
        if let Some(ip) = host_ip(&self.host) {
            return Ok(SocketAddr::new(ip, port));
        }
        let ips = resolver.lookup_ip(self.bare_host()).await?;
        ips.first()
            .map(|ip| SocketAddr::new(*ip, port))
            .ok_or_else(|| Error::Resolve {
                target: self.to_string(),
                reason: "no addresses found".to_string(),
            })
    }
}

impl From<SocketAddr> for Target {
    fn from(addr: SocketAddr) -> Self {
        Target {
            host: join_host_port(&addr.ip().to_string(), None),
            port: Some(addr.port()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_host_port(&self.host, self.port))
    }
}
