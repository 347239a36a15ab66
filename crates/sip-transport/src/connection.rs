//! A single live socket with a stable pool key.
//!
//! Packet connections wrap a bound `UdpSocket` and are shared by every
//! peer. Stream connections wrap one TCP, TLS or in-memory stream split into
//! halves: the pool's reader task takes the read half once, writers share
//! the write half under a lock so concurrent sends never interleave.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use sipflow_sip_core::TransportKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Bound on flushing and shutting down a stream in [`Connection::close`]
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Pool key, `<proto>:<address>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn new(network: TransportKind, addr: impl fmt::Display) -> Self {
        ConnectionKey(format!("{}:{}", network.srv_proto(), addr))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Byte streams a stream connection can wrap
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

enum Socket {
    Packet(UdpSocket),
    Stream {
        reader: Mutex<Option<ReadHalf<BoxedStream>>>,
        writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    },
}

pub struct Connection {
    key: ConnectionKey,
    network: TransportKind,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    socket: Socket,
}

impl Connection {
    /// Wrap a bound datagram socket
    pub fn packet(socket: UdpSocket, key: ConnectionKey, network: TransportKind) -> Result<Self> {
        let local_addr = socket
            .local_addr()
            .map_err(|e| Error::network("local_addr", network, "?", "?", e))?;
        Ok(Connection {
            key,
            network,
            local_addr,
            remote_addr: None,
            socket: Socket::Packet(socket),
        })
    }

    /// Wrap an established byte stream
    pub fn stream<S: AsyncStream>(
        stream: S,
        key: ConnectionKey,
        network: TransportKind,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self {
        let boxed: BoxedStream = Box::new(stream);
        let (reader, writer) = tokio::io::split(boxed);
        Connection {
            key,
            network,
            local_addr,
            remote_addr: Some(remote_addr),
            socket: Socket::Stream {
                reader: Mutex::new(Some(reader)),
                writer: tokio::sync::Mutex::new(writer),
            },
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn network(&self) -> TransportKind {
        self.network
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer address; `None` for packet connections
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn streamed(&self) -> bool {
        matches!(self.socket, Socket::Stream { .. })
    }

    fn remote_label(&self) -> String {
        self.remote_addr.map_or_else(|| "*".to_string(), |addr| addr.to_string())
    }

    /// Write to the connected peer of a stream connection
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        match &self.socket {
            Socket::Stream { writer, .. } => {
                let mut writer = writer.lock().await;
                writer.write_all(data).await.map_err(|e| self.write_error(e))?;
                writer.flush().await.map_err(|e| self.write_error(e))?;
                trace!(key = %self.key, bytes = data.len(), "wrote stream data");
                Ok(())
            }
            Socket::Packet(_) => Err(self.write_error(io::Error::new(
                io::ErrorKind::NotConnected,
                "packet connection needs a destination address",
            ))),
        }
    }

    /// [`write`](Self::write) bounded by `timeout`, zero meaning no bound.
    ///
    /// Waiting for the write lock counts against the deadline. Expiry yields
    /// a network error of kind `TimedOut`.
    pub async fn write_timeout(&self, data: &[u8], timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return self.write(data).await;
        }
        match tokio::time::timeout(timeout, self.write(data)).await {
            Ok(written) => written,
            Err(_) => Err(self.write_error(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write stalled for {:?}", timeout),
            ))),
        }
    }

    /// Write to `addr`; stream connections ignore the address
    pub async fn write_to(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        match &self.socket {
            Socket::Packet(socket) => {
                let sent = socket.send_to(data, addr).await.map_err(|e| {
                    Error::network("write", self.network, self.local_addr, addr, e)
                })?;
                if sent != data.len() {
                    return Err(Error::network(
                        "write",
                        self.network,
                        self.local_addr,
                        addr,
                        io::Error::new(
                            io::ErrorKind::WriteZero,
                            format!("wrote {} of {} bytes", sent, data.len()),
                        ),
                    ));
                }
                trace!(key = %self.key, bytes = sent, remote = %addr, "wrote datagram");
                Ok(())
            }
            Socket::Stream { .. } => self.write(data).await,
        }
    }

    /// Receive one datagram from a packet connection
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        match &self.socket {
            Socket::Packet(socket) => socket
                .recv_from(buf)
                .await
                .map_err(|e| Error::network("read", self.network, self.local_addr, "*", e)),
            Socket::Stream { .. } => Err(Error::network(
                "read",
                self.network,
                self.local_addr,
                self.remote_label(),
                io::Error::new(io::ErrorKind::Unsupported, "stream connection has no datagrams"),
            )),
        }
    }

    /// Read from a stream half taken with [`Connection::take_reader`].
    ///
    /// Zero bytes read means the peer closed the stream.
    pub(crate) async fn read_stream(
        &self,
        reader: &mut ReadHalf<BoxedStream>,
        buf: &mut [u8],
    ) -> Result<usize> {
        let n = reader.read(buf).await.map_err(|e| {
            Error::network("read", self.network, self.local_addr, self.remote_label(), e)
        })?;
        if n == 0 {
            return Err(Error::ConnectionClosed {
                key: self.key.to_string(),
            });
        }
        Ok(n)
    }

    /// Take the read half of a stream connection; only the first call succeeds.
    pub(crate) fn take_reader(&self) -> Option<ReadHalf<BoxedStream>> {
        match &self.socket {
            Socket::Stream { reader, .. } => reader.lock().take(),
            Socket::Packet(_) => None,
        }
    }

    /// Shut down the write side of a stream connection.
    ///
    /// Gives up after a short bound when a stalled writer holds the lock or
    /// the peer stops reading. Packet sockets close when the last reference
    /// is dropped.
    pub async fn close(&self) {
        if let Socket::Stream { writer, .. } = &self.socket {
            let shutdown = async { writer.lock().await.shutdown().await };
            if tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await.is_err() {
                debug!(key = %self.key, "stream shutdown timed out");
            }
        }
    }

    fn write_error(&self, source: io::Error) -> Error {
        Error::network("write", self.network, self.local_addr, self.remote_label(), source)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("network", &self.network)
            .field("local", &self.local_addr)
            .field("remote", &self.remote_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let key = ConnectionKey::new(TransportKind::Udp, "0.0.0.0:5060");
        assert_eq!(key.as_str(), "udp:0.0.0.0:5060");
        let addr: SocketAddr = "10.0.0.1:5061".parse().unwrap();
        assert_eq!(ConnectionKey::new(TransportKind::Tls, addr).to_string(), "tls:10.0.0.1:5061");
    }

    #[tokio::test]
    async fn test_packet_roundtrip() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = b.local_addr().unwrap();

        let key = ConnectionKey::new(TransportKind::Udp, "0.0.0.0:0");
        let conn_a = Connection::packet(a, key.clone(), TransportKind::Udp).unwrap();
        let conn_b = Connection::packet(b, key, TransportKind::Udp).unwrap();
        assert!(!conn_a.streamed());
        assert!(conn_a.write(b"x").await.is_err());

        conn_a.write_to(b"hello", b_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = conn_b.read_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, conn_a.local_addr());
    }

    #[tokio::test]
    async fn test_stream_eof() {
        let (client, server) = tokio::io::duplex(1024);
        let local: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let conn = Connection::stream(
            server,
            ConnectionKey::new(TransportKind::Tcp, remote),
            TransportKind::Tcp,
            local,
            remote,
        );
        let mut reader = conn.take_reader().unwrap();
        assert!(conn.take_reader().is_none());

        drop(client);
        let mut buf = [0u8; 16];
        let err = conn.read_stream(&mut reader, &mut buf).await.unwrap_err();
        assert!(err.is_eof());
    }

    fn stalled_stream(buffer: usize) -> (Connection, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(buffer);
        let local: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:40100".parse().unwrap();
        let conn = Connection::stream(
            server,
            ConnectionKey::new(TransportKind::Tcp, remote),
            TransportKind::Tcp,
            local,
            remote,
        );
        (conn, client)
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_deadline_on_stalled_peer() {
        // The peer half stays open but is never read
        let (conn, _peer) = stalled_stream(64);
        let err = conn
            .write_timeout(&[b'x'; 1024], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_network());
        assert!(matches!(&err, Error::Network { source, .. } if source.kind() == io::ErrorKind::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_with_stuck_writer_returns() {
        let (conn, _peer) = stalled_stream(64);
        let conn = std::sync::Arc::new(conn);
        let stuck = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.write(&[b'x'; 1024]).await })
        };
        tokio::task::yield_now().await;

        tokio::time::timeout(Duration::from_secs(5), conn.close())
            .await
            .expect("close must not wait on the stalled writer");
        assert!(!stuck.is_finished());
        stuck.abort();
    }

    #[tokio::test]
    async fn test_zero_write_timeout_is_unbounded() {
        let (conn, mut peer) = stalled_stream(1024);
        conn.write_timeout(b"hello", Duration::ZERO).await.unwrap();
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
