//! Listener pool.
//!
//! Each listener put into the pool runs an accept loop on the pool's task
//! tracker. Accepted streams are wrapped into [`Connection`]s and queued on
//! the pool output for the owning protocol to register in its
//! [`ConnectionPool`](crate::ConnectionPool). A failing accept is reported
//! once and its loop exits; restarting is an explicit `listen` call.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sipflow_infra_common::task::{spawn_guarded, spawn_tracked};
use sipflow_sip_core::TransportKind;
use tokio::io::DuplexStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionKey};
use crate::error::{Error, Result};

const POOL_NAME: &str = "listener";

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffer size of each in-memory mock stream
const MOCK_STREAM_BUFFER: usize = 64 * 1024;

/// A passive socket accepting stream connections
pub enum Listener {
    Tcp(TcpListener),
    Tls {
        listener: TcpListener,
        acceptor: TlsAcceptor,
    },
    Mock(MockListener),
}

enum Accepted {
    Tcp(TcpStream, SocketAddr),
    Mock(DuplexStream, SocketAddr),
}

impl Listener {
    pub fn network(&self) -> TransportKind {
        match self {
            Listener::Tcp(_) => TransportKind::Tcp,
            Listener::Tls { .. } => TransportKind::Tls,
            Listener::Mock(mock) => mock.network,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Listener::Tcp(listener) | Listener::Tls { listener, .. } => listener.local_addr(),
            Listener::Mock(mock) => Ok(mock.addr),
        }
    }

    async fn accept(&self) -> io::Result<Accepted> {
        match self {
            Listener::Tcp(listener) | Listener::Tls { listener, .. } => {
                let (stream, remote) = listener.accept().await?;
                Ok(Accepted::Tcp(stream, remote))
            }
            Listener::Mock(mock) => {
                let (stream, remote) = mock.accept().await?;
                Ok(Accepted::Mock(stream, remote))
            }
        }
    }
}

/// In-memory listener used instead of a bound socket.
///
/// It accepts only streams opened through its [`MockDialer`] and otherwise
/// waits until the pool cancels it.
pub struct MockListener {
    addr: SocketAddr,
    network: TransportKind,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<(DuplexStream, SocketAddr)>>,
    dialer: MockDialer,
}

/// Opens in-memory streams to a [`MockListener`]
#[derive(Clone)]
pub struct MockDialer {
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<(DuplexStream, SocketAddr)>,
}

impl MockListener {
    pub fn new(addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        MockListener {
            addr,
            network: TransportKind::Tcp,
            incoming: tokio::sync::Mutex::new(rx),
            dialer: MockDialer { addr, tx },
        }
    }

    /// Transport the accepted streams are tagged with
    pub fn with_network(mut self, network: TransportKind) -> Self {
        self.network = network;
        self
    }

    pub fn dialer(&self) -> MockDialer {
        self.dialer.clone()
    }

    async fn accept(&self) -> io::Result<(DuplexStream, SocketAddr)> {
        // The listener keeps a dialer, so the channel never closes underneath it.
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "mock listener closed"))
    }
}

impl MockDialer {
    /// Address of the listener this dialer connects to
    pub fn listener_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Open a stream as if it came from `remote`
    pub fn connect(&self, remote: SocketAddr) -> io::Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(MOCK_STREAM_BUFFER);
        self.tx
            .send((server, remote))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "mock listener closed"))?;
        Ok(client)
    }
}

/// Pool of accept loops keyed by `<proto>:<address>`
#[derive(Clone)]
pub struct ListenerPool {
    inner: Arc<ListenerPoolInner>,
}

struct ListenerPoolInner {
    store: RwLock<HashMap<ConnectionKey, ListenerEntry>>,
    accepted: mpsc::UnboundedSender<Connection>,
    failures: mpsc::UnboundedSender<(ConnectionKey, u64, Error)>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    tracker: TaskTracker,
    done: CancellationToken,
}

struct ListenerEntry {
    id: u64,
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl ListenerPool {
    /// Create a pool queueing accepted connections on `output` and
    /// surfacing listener failures on `errors`.
    pub fn new(
        output: mpsc::Sender<Connection>,
        errors: mpsc::Sender<Error>,
        cancel: CancellationToken,
    ) -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ListenerPoolInner {
            store: RwLock::new(HashMap::new()),
            accepted: accepted_tx,
            failures: failures_tx,
            next_id: AtomicU64::new(1),
            cancel,
            tracker: TaskTracker::new(),
            done: CancellationToken::new(),
        });
        spawn_guarded(
            "listener-pool",
            ListenerPoolInner::serve(inner.clone(), accepted_rx, failures_rx, output, errors),
        );
        ListenerPool { inner }
    }

    /// Start accepting on `listener` under `key`
    pub fn put(&self, key: ConnectionKey, listener: Listener) -> Result<SocketAddr> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::PoolClosed(POOL_NAME));
        }
        let addr = listener.local_addr().map_err(|source| Error::ListenerFailed {
            key: key.to_string(),
            source,
        })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.cancel.child_token();
        {
            let mut store = self.inner.store.write();
            if store.contains_key(&key) {
                return Err(Error::DuplicateKey {
                    pool: POOL_NAME,
                    key: key.to_string(),
                });
            }
            store.insert(
                key.clone(),
                ListenerEntry {
                    id,
                    addr,
                    cancel: cancel.clone(),
                },
            );
        }

        info!(key = %key, local = %addr, "listening");
        let inner = self.inner.clone();
        spawn_tracked(&self.inner.tracker, "listener-accept", async move {
            inner.accept_loop(key, id, listener, cancel).await;
        });
        Ok(addr)
    }

    /// Stop the accept loop and close the listener
    pub fn drop_listener(&self, key: &ConnectionKey) -> Result<()> {
        match self.inner.store.write().remove(key) {
            Some(entry) => {
                entry.cancel.cancel();
                Ok(())
            }
            None => Err(Error::KeyNotFound {
                pool: POOL_NAME,
                key: key.to_string(),
            }),
        }
    }

    pub fn drop_all(&self) {
        self.inner.remove_all();
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.inner.store.read().values().map(|entry| entry.addr).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.store.read().len()
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Resolves once the pool is canceled and every accept loop has exited
    pub async fn done(&self) {
        self.inner.done.cancelled().await;
    }
}

impl ListenerPoolInner {
    async fn accept_loop(
        self: Arc<Self>,
        key: ConnectionKey,
        id: u64,
        listener: Listener,
        cancel: CancellationToken,
    ) {
        let network = listener.network();
        let local = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                let _ = self.failures.send((key.clone(), id, Error::ListenerFailed {
                    key: key.to_string(),
                    source: e,
                }));
                return;
            }
        };

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let accepted = match accepted {
                Ok(accepted) => accepted,
                Err(source) => {
                    let _ = self.failures.send((key.clone(), id, Error::ListenerFailed {
                        key: key.to_string(),
                        source,
                    }));
                    break;
                }
            };

            match (accepted, &listener) {
                (Accepted::Tcp(stream, remote), Listener::Tls { acceptor, .. }) => {
                    let acceptor = acceptor.clone();
                    let accepted = self.accepted.clone();
                    spawn_tracked(&self.tracker, "tls-handshake", async move {
                        match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                            Ok(Ok(tls)) => {
                                let key = ConnectionKey::new(network, remote);
                                let _ = accepted.send(Connection::stream(tls, key, network, local, remote));
                            }
                            Ok(Err(e)) => warn!(remote = %remote, "TLS handshake failed: {}", e),
                            Err(_) => warn!(remote = %remote, "TLS handshake timed out"),
                        }
                    });
                }
                (Accepted::Tcp(stream, remote), _) => {
                    let key = ConnectionKey::new(network, remote);
                    let _ = self
                        .accepted
                        .send(Connection::stream(stream, key, network, local, remote));
                }
                (Accepted::Mock(stream, remote), _) => {
                    let key = ConnectionKey::new(network, remote);
                    let _ = self
                        .accepted
                        .send(Connection::stream(stream, key, network, local, remote));
                }
            }
            debug!(key = %key, "accepted connection");
        }
        debug!(key = %key, "accept loop stopped");
    }

    async fn serve(
        self: Arc<Self>,
        mut accepted: mpsc::UnboundedReceiver<Connection>,
        mut failures: mpsc::UnboundedReceiver<(ConnectionKey, u64, Error)>,
        output: mpsc::Sender<Connection>,
        errors: mpsc::Sender<Error>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(conn) = accepted.recv() => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        sent = output.send(conn) => if sent.is_err() { break },
                    }
                }
                Some((key, id, error)) = failures.recv() => {
                    let current = self.store.read().get(&key).map(|entry| entry.id);
                    if current != Some(id) {
                        continue;
                    }
                    self.store.write().remove(&key);
                    warn!(key = %key, "listener failed: {}", error);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        sent = errors.send(error) => if sent.is_err() { break },
                    }
                }
            }
        }

        self.remove_all();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("listener pool stopped");
        self.done.cancel();
    }

    fn remove_all(&self) {
        let entries: Vec<_> = self.store.write().drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            entry.cancel.cancel();
        }
    }
}
