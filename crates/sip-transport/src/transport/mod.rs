//! Transport protocols.
//!
//! A [`Protocol`] is the strategy for one transport kind: it knows how to
//! listen, dial and send, and reports whether RFC 3261 retransmissions are
//! needed on top of it. UDP is packet based and unreliable; TCP and TLS are
//! streamed and reliable and share one implementation.

pub mod tcp;
pub mod tls;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use sipflow_sip_core::{Message, TransportKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ListenOptions, TransportConfig};
use crate::error::{Error, Result};
use crate::listener_pool::MockDialer;
use crate::resolver::Resolver;
use crate::target::Target;

pub use tcp::TcpProtocol;
pub use udp::UdpProtocol;

#[async_trait]
pub trait Protocol: Send + Sync {
    fn network(&self) -> TransportKind;

    /// Reliable transports disable request and response retransmissions
    fn reliable(&self) -> bool;

    fn streamed(&self) -> bool;

    /// Start listening on `target`; returns the bound address.
    async fn listen(&self, target: Target, options: &ListenOptions) -> Result<SocketAddr>;

    /// Serialize and send `msg` to `target`.
    async fn send(&self, target: Target, msg: &Message) -> Result<()>;

    /// Resolves once the protocol has been canceled and every pool drained.
    async fn done(&self);

    /// Dialer of an in-memory listener bound to `port`, if any
    fn mock_dialer(&self, _port: u16) -> Option<MockDialer> {
        None
    }
}

/// Everything a protocol needs from the transport layer that owns it
#[derive(Clone)]
pub struct ProtocolContext {
    /// Inbound messages
    pub output: mpsc::Sender<Message>,
    /// Surfaced failures
    pub errors: mpsc::Sender<Error>,
    /// Fired when the owning layer shuts down
    pub cancel: CancellationToken,
    pub config: TransportConfig,
    /// Host name lookups for listen and send targets
    pub resolver: Arc<dyn Resolver>,
}

/// Builds the protocol for a transport kind
pub type ProtocolFactory =
    Arc<dyn Fn(TransportKind, ProtocolContext) -> Result<Arc<dyn Protocol>> + Send + Sync>;

/// The stock UDP, TCP and TLS protocols
pub fn default_protocol(network: TransportKind, ctx: ProtocolContext) -> Result<Arc<dyn Protocol>> {
    Ok(match network {
        TransportKind::Udp => Arc::new(UdpProtocol::new(ctx)),
        TransportKind::Tcp => Arc::new(TcpProtocol::tcp(ctx)),
        TransportKind::Tls => Arc::new(TcpProtocol::tls(ctx)),
    })
}

pub fn default_protocol_factory() -> ProtocolFactory {
    Arc::new(default_protocol)
}
