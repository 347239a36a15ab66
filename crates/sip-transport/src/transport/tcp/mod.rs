//! TCP and TLS protocol.
//!
//! Accepted connections are keyed by their remote address so that
//! responses go back over the stream their request arrived on. Sends reuse
//! a pooled connection to the target or dial a new one. Dialed and accepted
//! connections expire after the configured socket TTL. A write that stalls
//! past the write timeout drops its connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use sipflow_infra_common::task::spawn_guarded;
use sipflow_sip_core::{Message, TransportKind};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ListenOptions;
use crate::connection::{Connection, ConnectionKey};
use crate::connection_pool::ConnectionPool;
use crate::error::{Error, Result};
use crate::listener_pool::{Listener, ListenerPool, MockDialer, MockListener};
use crate::resolver::Resolver;
use crate::target::Target;
use crate::transport::{tls, Protocol, ProtocolContext};

const ACCEPT_QUEUE_CAPACITY: usize = 128;

pub struct TcpProtocol {
    network: TransportKind,
    connections: ConnectionPool,
    listeners: ListenerPool,
    connector: Option<TlsConnector>,
    sock_ttl: Duration,
    dial_timeout: Duration,
    write_timeout: Duration,
    resolver: Arc<dyn Resolver>,
    mock_dialers: RwLock<HashMap<u16, MockDialer>>,
    piped: CancellationToken,
}

impl TcpProtocol {
    pub fn tcp(ctx: ProtocolContext) -> Self {
        Self::build(TransportKind::Tcp, None, ctx)
    }

    pub fn tls(ctx: ProtocolContext) -> Self {
        let connector = tls::connector(ctx.config.tls_insecure_skip_verify);
        Self::build(TransportKind::Tls, Some(connector), ctx)
    }

    fn build(network: TransportKind, connector: Option<TlsConnector>, ctx: ProtocolContext) -> Self {
        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        let connections = ConnectionPool::new(ctx.output, ctx.errors.clone(), ctx.cancel.clone());
        let listeners = ListenerPool::new(accepted_tx, ctx.errors, ctx.cancel.clone());
        let piped = CancellationToken::new();

        spawn_guarded(
            "tcp-accept-pipe",
            pipe_accepted(
                connections.clone(),
                accepted_rx,
                ctx.config.sock_ttl,
                ctx.cancel,
                piped.clone(),
            ),
        );

        TcpProtocol {
            network,
            connections,
            listeners,
            connector,
            sock_ttl: ctx.config.sock_ttl,
            dial_timeout: ctx.config.dial_timeout,
            write_timeout: ctx.config.write_timeout,
            resolver: ctx.resolver,
            mock_dialers: RwLock::new(HashMap::new()),
            piped,
        }
    }

    async fn dial(&self, target: &Target, raddr: SocketAddr) -> Result<Connection> {
        let key = ConnectionKey::new(self.network, raddr);
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(raddr))
            .await
            .map_err(|_| {
                Error::network(
                    "dial",
                    self.network,
                    "*",
                    raddr,
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                )
            })?
            .map_err(|e| Error::network("dial", self.network, "*", raddr, e))?;
        let local = stream
            .local_addr()
            .map_err(|e| Error::network("dial", self.network, "*", raddr, e))?;

        let conn = match &self.connector {
            Some(connector) => {
                let name = tls::server_name(target.bare_host())?;
                let tls = tokio::time::timeout(self.dial_timeout, connector.connect(name, stream))
                    .await
                    .map_err(|_| Error::Tls(format!("handshake with {} timed out", raddr)))?
                    .map_err(|e| Error::Tls(format!("handshake with {}: {}", raddr, e)))?;
                Connection::stream(tls, key, self.network, local, raddr)
            }
            None => Connection::stream(stream, key, self.network, local, raddr),
        };
        debug!(local = %local, remote = %raddr, "{} connection established", self.network);
        Ok(conn)
    }

    /// Pooled connection to `raddr`, dialing one if needed
    async fn connection(&self, target: &Target, raddr: SocketAddr) -> Result<Arc<Connection>> {
        let key = ConnectionKey::new(self.network, raddr);
        if let Ok(conn) = self.connections.get(&key) {
            return Ok(conn);
        }

        let conn = self.dial(target, raddr).await?;
        match self.connections.put(conn, self.sock_ttl) {
            Ok(conn) => Ok(conn),
            // Lost a dial race; the dialed connection is dropped.
            Err(Error::DuplicateKey { .. }) => self.connections.get(&key),
            Err(e) => Err(e),
        }
    }
}

async fn pipe_accepted(
    connections: ConnectionPool,
    mut accepted: mpsc::Receiver<Connection>,
    ttl: Duration,
    cancel: CancellationToken,
    piped: CancellationToken,
) {
    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => break,
            conn = accepted.recv() => match conn {
                Some(conn) => conn,
                None => break,
            },
        };
        let key = conn.key().clone();
        if let Err(e) = connections.put(conn, ttl) {
            warn!(key = %key, "dropping accepted connection: {}", e);
        }
    }
    piped.cancel();
}

#[async_trait]
impl Protocol for TcpProtocol {
    fn network(&self) -> TransportKind {
        self.network
    }

    fn reliable(&self) -> bool {
        true
    }

    fn streamed(&self) -> bool {
        true
    }

    async fn listen(&self, target: Target, options: &ListenOptions) -> Result<SocketAddr> {
        let target = target.fill_defaults(self.network);
        let op = format!("listen on {}", target);
        let addr = target.resolve(self.resolver.as_ref()).await?;

        let listener = if options.mock {
            let mock = MockListener::new(addr).with_network(self.network);
            self.mock_dialers.write().insert(addr.port(), mock.dialer());
            Listener::Mock(mock)
        } else {
            let tcp = TcpListener::bind(addr).await.map_err(|e| {
                Error::protocol(self.network, op.clone(), Error::network("bind", self.network, addr, "*", e))
            })?;
            match self.network {
                TransportKind::Tls => {
                    let (cert, key) = match (&options.tls_cert, &options.tls_key) {
                        (Some(cert), Some(key)) => (cert, key),
                        _ => {
                            return Err(Error::protocol(
                                self.network,
                                op,
                                Error::Tls("certificate and key files are required".to_string()),
                            ))
                        }
                    };
                    Listener::Tls {
                        listener: tcp,
                        acceptor: tls::acceptor(cert, key)?,
                    }
                }
                _ => Listener::Tcp(tcp),
            }
        };

        let local = listener
            .local_addr()
            .map_err(|e| Error::network("bind", self.network, addr, "*", e))?;
        let key = ConnectionKey::new(self.network, local);
        self.listeners.put(key, listener)?;
        info!(local = %local, mock = options.mock, "{} protocol listening", self.network);
        Ok(local)
    }

    async fn send(&self, target: Target, msg: &Message) -> Result<()> {
        let target = target.fill_defaults(self.network);
        let raddr = target.resolve(self.resolver.as_ref()).await?;
        let conn = self
            .connection(&target, raddr)
            .await
            .map_err(|e| Error::protocol(self.network, format!("send to {}", target), e))?;

        debug!(key = %conn.key(), "sending {}", msg.short());
        let written = conn.write_timeout(&msg.to_bytes(), self.write_timeout).await;
        if let Err(e) = &written {
            if e.is_network() {
                warn!(key = %conn.key(), "write failed, dropping connection: {}", e);
                let _ = self.connections.drop_connection(conn.key());
            }
        }
        written
    }

    async fn done(&self) {
        self.listeners.done().await;
        self.piped.cancelled().await;
        self.connections.done().await;
    }

    fn mock_dialer(&self, port: u16) -> Option<MockDialer> {
        self.mock_dialers.read().get(&port).cloned()
    }
}
