//! UDP protocol.
//!
//! Every bound socket is registered once in the connection pool under
//! `udp:0.0.0.0:<port>` with no expiry and serves all peers. A send goes out
//! through the socket whose local port matches the message's source port,
//! so replies leave from the port the Via advertises.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sipflow_sip_core::{split_host_port, Message, TransportKind};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::config::ListenOptions;
use crate::connection::{Connection, ConnectionKey};
use crate::connection_pool::ConnectionPool;
use crate::error::{Error, Result};
use crate::resolver::Resolver;
use crate::target::Target;
use crate::transport::{Protocol, ProtocolContext};

pub struct UdpProtocol {
    connections: ConnectionPool,
    resolver: Arc<dyn Resolver>,
}

impl UdpProtocol {
    pub fn new(ctx: ProtocolContext) -> Self {
        UdpProtocol {
            connections: ConnectionPool::new(ctx.output, ctx.errors, ctx.cancel),
            resolver: ctx.resolver,
        }
    }

    fn connection_for(&self, msg: &Message) -> Result<Arc<Connection>> {
        let connections = self.connections.all();
        let port = msg
            .source()
            .and_then(|source| split_host_port(&source).ok())
            .and_then(|(_, port)| port);

        let found = match port {
            Some(port) => connections
                .into_iter()
                .find(|conn| conn.local_addr().port() == port),
            None => connections.into_iter().next(),
        };
        found.ok_or_else(|| Error::KeyNotFound {
            pool: "connection",
            key: format!(
                "connection on port {}",
                port.map_or_else(|| "*".to_string(), |p| p.to_string())
            ),
        })
    }
}

#[async_trait]
impl Protocol for UdpProtocol {
    fn network(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn reliable(&self) -> bool {
        false
    }

    fn streamed(&self) -> bool {
        false
    }

    async fn listen(&self, target: Target, _options: &ListenOptions) -> Result<SocketAddr> {
        let target = target.fill_defaults(TransportKind::Udp);
        let addr = target.resolve(self.resolver.as_ref()).await?;
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            Error::protocol(
                TransportKind::Udp,
                format!("listen on {}", target),
                Error::network("bind", TransportKind::Udp, addr, "*", e),
            )
        })?;

        let local = socket
            .local_addr()
            .map_err(|e| Error::network("bind", TransportKind::Udp, addr, "*", e))?;
        let key = ConnectionKey::new(TransportKind::Udp, format!("0.0.0.0:{}", local.port()));
        let conn = Connection::packet(socket, key, TransportKind::Udp)?;
        self.connections.put(conn, Duration::ZERO)?;
        info!(local = %local, "UDP protocol listening");
        Ok(local)
    }

    async fn send(&self, target: Target, msg: &Message) -> Result<()> {
        let target = target.fill_defaults(TransportKind::Udp);
        let raddr = target.resolve(self.resolver.as_ref()).await?;
        let conn = self
            .connection_for(msg)
            .map_err(|e| Error::protocol(TransportKind::Udp, format!("send to {}", target), e))?;

        debug!(key = %conn.key(), remote = %raddr, "sending {}", msg.short());
        conn.write_to(&msg.to_bytes(), raddr).await
    }

    async fn done(&self) {
        self.connections.done().await;
    }
}
