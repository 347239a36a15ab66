//! Connection pool.
//!
//! Every connection put into the pool gets a [`ConnectionHandler`] running
//! on the pool's task tracker. The handler owns the read loop and, when a
//! TTL is set, an idle-expiry watcher. Handlers never touch the store: they
//! report parsed messages and failures to the pool's serve loop, which is the
//! only place that decides whether a connection is dropped and whether an
//! error is surfaced.
//!
//! Error routing in the serve loop:
//!
//! - expiry: drop the connection if the reporting handler is still the one
//!   stored under the key and it is still expired; otherwise the report is
//!   spurious and ignored
//! - peer close (EOF): drop the connection silently
//! - socket fault: drop the connection and surface the error
//! - broken stream framing: drop the connection and surface the error
//! - anything else (malformed message, short datagram body): surface the
//!   error and keep the connection
//!
//! Syntax errors are filtered in the handler and only logged.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use sipflow_infra_common::task::{spawn_guarded, spawn_tracked};
use sipflow_sip_core::{host_ip, join_host_port, parse_message, Message, StreamParser};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::connection::{Connection, ConnectionKey};
use crate::error::{Error, Result};

/// Largest datagram a packet reader accepts
pub const MAX_DATAGRAM_SIZE: usize = 65535;

const STREAM_READ_BUFFER: usize = 16 * 1024;

const POOL_NAME: &str = "connection";

enum HandlerEvent {
    Message(Message),
    Failed {
        key: ConnectionKey,
        handler_id: u64,
        error: Error,
    },
}

/// Pool of live connections keyed by [`ConnectionKey`]
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    store: RwLock<HashMap<ConnectionKey, Arc<ConnectionHandler>>>,
    events: mpsc::UnboundedSender<HandlerEvent>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    tracker: TaskTracker,
    done: CancellationToken,
}

impl ConnectionPool {
    /// Create a pool delivering inbound messages to `output` and surfaced
    /// failures to `errors`. The pool shuts down when `cancel` fires.
    pub fn new(
        output: mpsc::Sender<Message>,
        errors: mpsc::Sender<Error>,
        cancel: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            store: RwLock::new(HashMap::new()),
            events: events_tx,
            next_id: AtomicU64::new(1),
            cancel,
            tracker: TaskTracker::new(),
            done: CancellationToken::new(),
        });
        spawn_guarded(
            "connection-pool",
            PoolInner::serve(inner.clone(), events_rx, output, errors),
        );
        ConnectionPool { inner }
    }

    /// Register `connection` and start reading from it.
    ///
    /// A zero `ttl` disables idle expiry. Fails with
    /// [`Error::DuplicateKey`] when the key is taken; the passed connection
    /// is dropped in that case.
    pub fn put(&self, connection: Connection, ttl: Duration) -> Result<Arc<Connection>> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::PoolClosed(POOL_NAME));
        }

        let key = connection.key().clone();
        let connection = Arc::new(connection);
        let handler = {
            let mut store = self.inner.store.write();
            if store.contains_key(&key) {
                return Err(Error::DuplicateKey {
                    pool: POOL_NAME,
                    key: key.to_string(),
                });
            }
            let handler = Arc::new(ConnectionHandler {
                id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
                connection: connection.clone(),
                ttl,
                expiry: Mutex::new(None),
                cancel: self.inner.cancel.child_token(),
                events: self.inner.events.clone(),
                tracker: self.inner.tracker.clone(),
            });
            store.insert(key.clone(), handler.clone());
            handler
        };

        debug!(
            key = %key,
            local = %connection.local_addr(),
            remote = ?connection.remote_addr(),
            ttl_ms = ttl.as_millis() as u64,
            "connection added to pool"
        );
        handler.start();
        Ok(connection)
    }

    pub fn get(&self, key: &ConnectionKey) -> Result<Arc<Connection>> {
        self.inner
            .store
            .read()
            .get(key)
            .map(|handler| handler.connection.clone())
            .ok_or_else(|| Error::KeyNotFound {
                pool: POOL_NAME,
                key: key.to_string(),
            })
    }

    /// Stop the connection's reader and remove it
    pub fn drop_connection(&self, key: &ConnectionKey) -> Result<()> {
        if self.inner.remove(key) {
            Ok(())
        } else {
            Err(Error::KeyNotFound {
                pool: POOL_NAME,
                key: key.to_string(),
            })
        }
    }

    pub fn drop_all(&self) {
        self.inner.remove_all();
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.inner
            .store
            .read()
            .values()
            .map(|handler| handler.connection.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Resolves once the pool is canceled and every handler has exited
    pub async fn done(&self) {
        self.inner.done.cancelled().await;
    }
}

impl PoolInner {
    async fn serve(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<HandlerEvent>,
        output: mpsc::Sender<Message>,
        errors: mpsc::Sender<Error>,
    ) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                HandlerEvent::Message(msg) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        sent = output.send(msg) => if sent.is_err() {
                            debug!("connection pool output closed");
                            break;
                        },
                    }
                }
                HandlerEvent::Failed {
                    key,
                    handler_id,
                    error,
                } => {
                    let Some(error) = self.route_failure(&key, handler_id, error) else {
                        continue;
                    };
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        sent = errors.send(error) => if sent.is_err() {
                            debug!("connection pool error queue closed");
                            break;
                        },
                    }
                }
            }
        }

        self.dispose().await;
    }

    /// Decide what a handler failure means; returns the error to surface.
    fn route_failure(&self, key: &ConnectionKey, handler_id: u64, error: Error) -> Option<Error> {
        let Some(handler) = self.store.read().get(key).cloned() else {
            trace!(key = %key, "ignoring error from a connection no longer in the pool: {}", error);
            return None;
        };

        if error.is_expired() {
            if handler.id != handler_id {
                debug!(key = %key, "ignoring spurious expiry of a replaced connection");
            } else if handler.expired() {
                debug!(key = %key, "connection expired, dropping");
                self.remove(key);
            } else {
                debug!(key = %key, "connection used since expiry fired, keeping it");
                handler.spawn_expiry_watcher();
            }
            return None;
        }

        if handler.id != handler_id {
            trace!(key = %key, "ignoring error from a replaced connection: {}", error);
            return None;
        }

        if error.is_eof() {
            debug!(key = %key, "connection closed by peer, dropping");
            self.remove(key);
            return None;
        }

        if error.is_network() {
            warn!(key = %key, "connection failed, dropping: {}", error);
            self.remove(key);
        } else if error.is_broken() && handler.connection.streamed() {
            warn!(key = %key, "stream framing lost, dropping: {}", error);
            self.remove(key);
        }
        Some(error)
    }

    fn remove(&self, key: &ConnectionKey) -> bool {
        let removed = self.store.write().remove(key);
        match removed {
            Some(handler) => {
                handler.cancel.cancel();
                trace!(key = %key, "connection removed from pool");
                true
            }
            None => false,
        }
    }

    fn remove_all(&self) {
        let handlers: Vec<_> = self.store.write().drain().map(|(_, handler)| handler).collect();
        for handler in handlers {
            handler.cancel.cancel();
        }
    }

    async fn dispose(&self) {
        self.remove_all();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("connection pool stopped");
        self.done.cancel();
    }
}

/// Read loop and idle timer of one pooled connection
struct ConnectionHandler {
    id: u64,
    connection: Arc<Connection>,
    ttl: Duration,
    expiry: Mutex<Option<Instant>>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<HandlerEvent>,
    tracker: TaskTracker,
}

impl ConnectionHandler {
    fn start(self: &Arc<Self>) {
        if !self.ttl.is_zero() {
            *self.expiry.lock() = Some(Instant::now() + self.ttl);
            self.spawn_expiry_watcher();
        }
        let handler = self.clone();
        spawn_tracked(&self.tracker, "connection-reader", async move {
            if handler.connection.streamed() {
                handler.read_stream().await;
            } else {
                handler.read_packets().await;
            }
            handler.connection.close().await;
            trace!(key = %handler.connection.key(), "connection reader stopped");
        });
    }

    fn expired(&self) -> bool {
        self.expiry
            .lock()
            .map_or(false, |deadline| Instant::now() >= deadline)
    }

    /// Push the expiry deadline out by one TTL
    fn touch(&self) {
        if !self.ttl.is_zero() {
            *self.expiry.lock() = Some(Instant::now() + self.ttl);
        }
    }

    fn spawn_expiry_watcher(self: &Arc<Self>) {
        let handler = self.clone();
        spawn_tracked(&self.tracker, "connection-expiry", async move {
            handler.watch_expiry().await;
        });
    }

    /// Sleep until the deadline, re-reading it after every wake-up since
    /// inbound traffic moves it forward.
    async fn watch_expiry(&self) {
        loop {
            let Some(deadline) = *self.expiry.lock() else {
                return;
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {}
            }
            if self.expired() {
                self.report(Error::Expired {
                    key: self.connection.key().to_string(),
                });
                return;
            }
        }
    }

    async fn read_stream(&self) {
        let Some(mut reader) = self.connection.take_reader() else {
            return;
        };
        let raddr = self
            .connection
            .remote_addr()
            .unwrap_or_else(|| self.connection.local_addr());
        let mut parser = StreamParser::new();
        let mut buf = vec![0u8; STREAM_READ_BUFFER];

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return,
                read = self.connection.read_stream(&mut reader, &mut buf) => read,
            };
            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    self.report(e);
                    return;
                }
            };
            trace!(key = %self.connection.key(), bytes = n, "read stream data");

            parser.feed(&buf[..n]);
            while let Some(parsed) = parser.next_message() {
                match parsed {
                    Ok(msg) => self.handle_message(msg, raddr),
                    Err(e) if e.is_broken() => {
                        self.report(Error::Message(e));
                        return;
                    }
                    Err(e) => self.handle_error(Error::Message(e)),
                }
            }
        }
    }

    async fn read_packets(self: &Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return,
                read = self.connection.read_from(&mut buf) => read,
            };
            let (n, raddr) = match read {
                Ok(read) => read,
                Err(e) => {
                    self.report(e);
                    return;
                }
            };

            let data = &buf[..n];
            if data.iter().all(|b| *b == 0 || b.is_ascii_whitespace()) {
                trace!(key = %self.connection.key(), remote = %raddr, "skipping keep-alive datagram");
                continue;
            }

            // Datagrams are independent; parse them concurrently.
            let data = Bytes::copy_from_slice(data);
            let handler = self.clone();
            spawn_tracked(&self.tracker, "packet-redirect", async move {
                match parse_message(&data) {
                    Ok(msg) => handler.handle_message(msg, raddr),
                    Err(e) => handler.handle_error(Error::Message(e)),
                }
            });
        }
    }

    /// Stamp transport metadata on an inbound message (RFC 3261 18.2.1,
    /// RFC 3581) and hand it to the pool.
    fn handle_message(&self, mut msg: Message, raddr: SocketAddr) {
        let network = self.connection.network();
        let rhost = raddr.ip().to_string();
        let mut source = raddr.to_string();

        if let Message::Request(req) = &mut msg {
            let mut hop = match req.via_hop() {
                Ok(hop) => hop,
                Err(e) => {
                    warn!(
                        key = %self.connection.key(),
                        remote = %raddr,
                        "discarding request without a usable Via: {}",
                        e
                    );
                    return;
                }
            };
            if host_ip(&hop.host) != Some(raddr.ip()) {
                hop.params.set("received", Some(rhost.clone()));
            }
            if hop.params.contains("rport") {
                hop.params.set("rport", Some(raddr.port().to_string()));
            } else if !self.connection.streamed() {
                let port = hop.port.unwrap_or_else(|| network.default_port());
                source = join_host_port(&rhost, Some(port));
            }
            req.set_via_hop(&hop);
        }

        msg.set_transport(network);
        msg.set_source(source);
        msg.set_destination(self.connection.local_addr().to_string());

        trace!(
            key = %self.connection.key(),
            remote = %raddr,
            "received {}",
            msg.short()
        );
        self.touch();
        let _ = self.events.send(HandlerEvent::Message(msg));
    }

    fn handle_error(&self, error: Error) {
        if error.is_syntax() {
            warn!(key = %self.connection.key(), "discarding unparsable data: {}", error);
            return;
        }
        self.report(error);
    }

    fn report(&self, error: Error) {
        let _ = self.events.send(HandlerEvent::Failed {
            key: self.connection.key().clone(),
            handler_id: self.id,
            error,
        });
    }
}
