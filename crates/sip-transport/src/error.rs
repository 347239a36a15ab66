//! Error types for the SIP transport layer

use std::io;

use sipflow_sip_core::TransportKind;
use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the transport layer
#[derive(Debug, Error)]
pub enum Error {
    /// Socket level failure; the owning connection or listener is dropped
    #[error("{network} {op} {local} -> {remote}: {source}")]
    Network {
        op: &'static str,
        network: TransportKind,
        local: String,
        remote: String,
        #[source]
        source: io::Error,
    },

    /// A listener failed and its accept loop exited
    #[error("listener {key} failed: {source}")]
    ListenerFailed {
        key: String,
        #[source]
        source: io::Error,
    },

    /// The peer closed the connection
    #[error("connection {key} closed by peer")]
    ConnectionClosed { key: String },

    /// The connection idled past its TTL
    #[error("connection {key} expired")]
    Expired { key: String },

    /// No protocol is registered for the transport
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(TransportKind),

    /// Host name resolution failed
    #[error("failed to resolve {target}: {reason}")]
    Resolve { target: String, reason: String },

    /// A protocol operation failed
    #[error("{network} protocol {op} failed: {source}")]
    Protocol {
        network: TransportKind,
        op: String,
        #[source]
        source: Box<Error>,
    },

    /// Inbound data could not be parsed into a SIP message
    #[error("message error: {0}")]
    Message(#[from] sipflow_sip_core::Error),

    /// The request has no Via header to rewrite
    #[error("request has no Via header")]
    MissingVia,

    #[error("{pool} pool: key {key} already exists")]
    DuplicateKey { pool: &'static str, key: String },

    #[error("{pool} pool: key {key} not found")]
    KeyNotFound { pool: &'static str, key: String },

    #[error("{0} pool is closed")]
    PoolClosed(&'static str),

    /// Certificate loading or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("transport layer canceled")]
    LayerCanceled,

    #[error("invalid target address: {0}")]
    InvalidTarget(String),
}

impl Error {
    pub(crate) fn network(
        op: &'static str,
        network: TransportKind,
        local: impl ToString,
        remote: impl ToString,
        source: io::Error,
    ) -> Self {
        Error::Network {
            op,
            network,
            local: local.to_string(),
            remote: remote.to_string(),
            source,
        }
    }

    pub(crate) fn protocol(network: TransportKind, op: impl Into<String>, source: Error) -> Self {
        Error::Protocol {
            network,
            op: op.into(),
            source: Box::new(source),
        }
    }

    /// True for socket level faults, looking through protocol wrappers
    pub fn is_network(&self) -> bool {
        match self {
            Error::Network { .. } | Error::ListenerFailed { .. } => true,
            Error::Protocol { source, .. } => source.is_network(),
            _ => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, Error::Expired { .. })
    }

    /// True when the peer closed the connection
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::ConnectionClosed { .. })
    }

    /// True for parse failures that are dropped rather than reported
    pub fn is_syntax(&self) -> bool {
        matches!(self, Error::Message(e) if e.is_syntax())
    }

    /// True for a message whose body is shorter than its Content-Length
    pub fn is_broken(&self) -> bool {
        matches!(self, Error::Message(e) if e.is_broken())
    }
}
