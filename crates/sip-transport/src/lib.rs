//! SIP transport layer for the sipflow stack
//!
//! This crate moves SIP messages over UDP, TCP and TLS:
//!
//! - [`Connection`] wraps one socket under a stable [`ConnectionKey`]
//! - [`ConnectionPool`] runs a reader per connection, parses inbound data
//!   and expires idle connections
//! - [`ListenerPool`] runs accept loops and hands accepted streams to the
//!   owning protocol
//! - [`Protocol`] implementations ([`UdpProtocol`], [`TcpProtocol`]) listen,
//!   dial and send for one transport kind
//! - [`TransportLayer`] owns the protocols, rewrites outgoing Via headers,
//!   resolves destinations (including DNS SRV) and fans inbound messages and
//!   errors into two queues

pub mod config;
pub mod connection;
pub mod connection_pool;
pub mod error;
pub mod layer;
pub mod listener_pool;
pub mod resolver;
pub mod target;
pub mod transport;

pub use config::{ListenOptions, TransportConfig};
pub use connection::{Connection, ConnectionKey};
pub use connection_pool::ConnectionPool;
pub use error::{Error, Result};
pub use layer::TransportLayer;
pub use listener_pool::{Listener, ListenerPool, MockDialer, MockListener};
pub use resolver::{HickoryResolver, Resolver, SrvRecord, StaticResolver};
pub use target::Target;
pub use transport::{Protocol, ProtocolContext, ProtocolFactory, TcpProtocol, UdpProtocol};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        Error, ListenOptions, Protocol, Result, Target, TransportConfig, TransportLayer,
    };
    pub use sipflow_sip_core::{Message, TransportKind};
}
