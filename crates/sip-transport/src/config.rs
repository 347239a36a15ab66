//! Transport layer configuration

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sipflow_infra_common::config::{duration_ms, millis};

/// Idle lifetime of dialed and accepted stream connections
pub const DEFAULT_SOCK_TTL: Duration = millis(60 * 60 * 1000);

/// Default capacity of the inbound message and error queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Settings shared by every protocol of a [`TransportLayer`](crate::TransportLayer)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address written into the sent-by of outgoing Via headers
    pub host_ip: IpAddr,
    /// Idle TTL of TCP/TLS connections; zero disables expiry
    #[serde(rename = "sock_ttl_ms", with = "duration_ms")]
    pub sock_ttl: Duration,
    /// Upper bound for establishing a TCP/TLS connection
    #[serde(rename = "dial_timeout_ms", with = "duration_ms")]
    pub dial_timeout: Duration,
    /// Upper bound for writing one message to a TCP/TLS connection; zero
    /// disables the deadline
    #[serde(rename = "write_timeout_ms", with = "duration_ms")]
    pub write_timeout: Duration,
    /// Capacity of the inbound message and error queues
    pub queue_capacity: usize,
    /// Accept any server certificate when dialing TLS
    pub tls_insecure_skip_verify: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            host_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            sock_ttl: DEFAULT_SOCK_TTL,
            dial_timeout: millis(10_000),
            write_timeout: millis(10_000),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            tls_insecure_skip_verify: false,
        }
    }
}

impl TransportConfig {
    pub fn new(host_ip: IpAddr) -> Self {
        TransportConfig {
            host_ip,
            ..Default::default()
        }
    }

    pub fn with_sock_ttl(mut self, ttl: Duration) -> Self {
        self.sock_ttl = ttl;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_insecure_tls(mut self) -> Self {
        self.tls_insecure_skip_verify = true;
        self
    }
}

/// Per-listen options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenOptions {
    /// PEM certificate chain, required for TLS
    pub tls_cert: Option<PathBuf>,
    /// PEM private key, required for TLS
    pub tls_key: Option<PathBuf>,
    /// Use an in-memory listener instead of binding a socket
    pub mock: bool,
}

impl ListenOptions {
    pub fn tls(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        ListenOptions {
            tls_cert: Some(cert.into()),
            tls_key: Some(key.into()),
            mock: false,
        }
    }

    pub fn mock() -> Self {
        ListenOptions {
            mock: true,
            ..Default::default()
        }
    }
}
