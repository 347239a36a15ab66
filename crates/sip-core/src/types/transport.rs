use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Transport protocol a message travels over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [TransportKind::Udp, TransportKind::Tcp, TransportKind::Tls];

    /// Upper-case token as used in Via headers
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }

    /// Lower-case protocol label used in SRV names (`_sip._udp.example.com`)
    /// and connection keys
    pub fn srv_proto(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::Udp | TransportKind::Tcp => 5060,
            TransportKind::Tls => 5061,
        }
    }

    /// Reliable transports disable request/response retransmission
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    /// Streamed transports need Content-Length framing
    pub fn is_streamed(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UDP" => Ok(TransportKind::Udp),
            "TCP" => Ok(TransportKind::Tcp),
            "TLS" => Ok(TransportKind::Tls),
            other => Err(Error::UnsupportedTransport(other.to_string())),
        }
    }
}
