//! Transport layer.
//!
//! Owns one [`Protocol`] per transport kind, created on the first `listen`
//! for that kind. Outbound requests get their top Via rewritten (RFC 3261
//! 18.1.1) and their destination resolved, including DNS SRV lookup for
//! host names. Inbound messages and errors from every protocol are fanned
//! into two queues taken once by the consumer, usually the transaction
//! layer.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use sipflow_infra_common::task::spawn_guarded;
use sipflow_sip_core::{join_host_port, Message, TransportKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ListenOptions, TransportConfig};
use crate::error::{Error, Result};
use crate::listener_pool::MockDialer;
use crate::resolver::{resolve_srv, HickoryResolver, Resolver};
use crate::target::Target;
use crate::transport::{default_protocol_factory, Protocol, ProtocolContext, ProtocolFactory};

#[derive(Clone)]
pub struct TransportLayer {
    inner: Arc<LayerInner>,
}

struct LayerInner {
    config: TransportConfig,
    resolver: Arc<dyn Resolver>,
    factory: ProtocolFactory,
    protocols: RwLock<HashMap<TransportKind, Arc<dyn Protocol>>>,
    listen_ports: RwLock<HashMap<TransportKind, Vec<u16>>>,
    protocol_output: mpsc::Sender<Message>,
    protocol_errors: mpsc::Sender<Error>,
    messages: Mutex<Option<mpsc::Receiver<Message>>>,
    errors: Mutex<Option<mpsc::Receiver<Error>>>,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl TransportLayer {
    /// Layer using the system DNS resolver and the stock protocols
    pub fn new(config: TransportConfig) -> Self {
        Self::with_components(config, Arc::new(HickoryResolver::new()), default_protocol_factory())
    }

    pub fn with_resolver(config: TransportConfig, resolver: Arc<dyn Resolver>) -> Self {
        Self::with_components(config, resolver, default_protocol_factory())
    }

    pub fn with_components(
        config: TransportConfig,
        resolver: Arc<dyn Resolver>,
        factory: ProtocolFactory,
    ) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (proto_msgs_tx, proto_msgs_rx) = mpsc::channel(capacity);
        let (proto_errs_tx, proto_errs_rx) = mpsc::channel(capacity);
        let (msgs_tx, msgs_rx) = mpsc::channel(capacity);
        let (errs_tx, errs_rx) = mpsc::channel(capacity);

        let inner = Arc::new(LayerInner {
            config,
            resolver,
            factory,
            protocols: RwLock::new(HashMap::new()),
            listen_ports: RwLock::new(HashMap::new()),
            protocol_output: proto_msgs_tx,
            protocol_errors: proto_errs_tx,
            messages: Mutex::new(Some(msgs_rx)),
            errors: Mutex::new(Some(errs_rx)),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        });
        spawn_guarded(
            "transport-layer",
            LayerInner::serve(inner.clone(), proto_msgs_rx, proto_errs_rx, msgs_tx, errs_tx),
        );
        TransportLayer { inner }
    }

    /// Address written into outgoing Via headers
    pub fn host_ip(&self) -> IpAddr {
        self.inner.config.host_ip
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Reliability of `network`; known from the transport kind before any
    /// protocol is created.
    pub fn is_reliable(&self, network: TransportKind) -> bool {
        self.protocol(network)
            .map_or_else(|_| network.is_reliable(), |protocol| protocol.reliable())
    }

    pub fn is_streamed(&self, network: TransportKind) -> bool {
        self.protocol(network)
            .map_or_else(|_| network.is_streamed(), |protocol| protocol.streamed())
    }

    /// Listen on `addr` (`host:port`, either part may be empty) and return
    /// the bound address. The bound port becomes a sent-by candidate for
    /// outgoing requests on `network`.
    pub async fn listen(
        &self,
        network: TransportKind,
        addr: &str,
        options: &ListenOptions,
    ) -> Result<SocketAddr> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::LayerCanceled);
        }

        let target = if addr.is_empty() {
            Target::new("", None)
        } else {
            Target::from_addr(addr)?
        };
        let protocol = self.protocol_or_create(network)?;
        let local = protocol.listen(target, options).await?;

        let mut ports = self.inner.listen_ports.write();
        let ports = ports.entry(network).or_default();
        if !ports.contains(&local.port()) {
            ports.push(local.port());
        }
        Ok(local)
    }

    /// Ports listened on for `network`
    pub fn listen_ports(&self, network: TransportKind) -> Vec<u16> {
        self.inner
            .listen_ports
            .read()
            .get(&network)
            .cloned()
            .unwrap_or_default()
    }

    /// Send a message.
    ///
    /// Requests (RFC 3261 18.1.1) go out on their own transport with the top
    /// Via sent-by rewritten to this layer; responses (18.2.2) go out on the
    /// transport they arrived on, to their destination.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::LayerCanceled);
        }

        let mut msg = msg.clone();
        let mut hop = msg.via_hop().map_err(|_| Error::MissingVia)?;

        match &mut msg {
            Message::Request(req) => {
                let network = req.transport();
                let protocol = self.protocol(network)?;

                hop.transport = network.as_str().to_string();
                hop.host = join_host_port(&self.inner.config.host_ip.to_string(), None);
                if hop.port.is_none() {
                    hop.port = Some(self.sent_by_port(network));
                }
                req.set_via_hop(&hop);

                let destination = req.destination();
                let mut target = Target::from_addr(&destination)?;
                if !target.is_ip() {
                    if let Some(resolved) =
                        resolve_srv(self.inner.resolver.as_ref(), network, &target.host).await
                    {
                        target = resolved;
                    }
                }
                req.uri.params.remove("transport");

                debug!(target = %target, "sending request {}", req.short());
                protocol
                    .send(target.clone(), &msg)
                    .await
                    .map_err(|e| Error::protocol(network, format!("send to {}", target), e))
            }
            Message::Response(res) => {
                let network = res.transport();
                let protocol = self.protocol(network)?;
                let destination = res
                    .destination()
                    .ok_or_else(|| Error::InvalidTarget("response has no destination".to_string()))?;
                let target = Target::from_addr(&destination)?;

                debug!(target = %target, "sending response {}", res.short());
                protocol
                    .send(target.clone(), &msg)
                    .await
                    .map_err(|e| Error::protocol(network, format!("send to {}", target), e))
            }
        }
    }

    /// Inbound message queue; only the first call returns it.
    pub fn take_messages(&self) -> Option<mpsc::Receiver<Message>> {
        self.inner.messages.lock().take()
    }

    /// Surfaced error queue; only the first call returns it.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<Error>> {
        self.inner.errors.lock().take()
    }

    /// Dialer for an in-memory listener created with [`ListenOptions::mock`]
    pub fn mock_dialer(&self, network: TransportKind, port: u16) -> Option<MockDialer> {
        self.protocol(network).ok()?.mock_dialer(port)
    }

    /// Start shutting down; idempotent.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once every protocol has drained and the queues are closed
    pub async fn done(&self) {
        self.inner.done.cancelled().await;
    }

    fn protocol(&self, network: TransportKind) -> Result<Arc<dyn Protocol>> {
        self.inner
            .protocols
            .read()
            .get(&network)
            .cloned()
            .ok_or(Error::UnsupportedProtocol(network))
    }

    fn protocol_or_create(&self, network: TransportKind) -> Result<Arc<dyn Protocol>> {
        let mut protocols = self.inner.protocols.write();
        if let Some(protocol) = protocols.get(&network) {
            return Ok(protocol.clone());
        }
        let ctx = ProtocolContext {
            output: self.inner.protocol_output.clone(),
            errors: self.inner.protocol_errors.clone(),
            cancel: self.inner.cancel.child_token(),
            config: self.inner.config.clone(),
            resolver: self.inner.resolver.clone(),
        };
        let protocol = (self.inner.factory)(network, ctx)?;
        protocols.insert(network, protocol.clone());
        debug!("{} protocol created", network);
        Ok(protocol)
    }

    /// A random listening port for `network`, or its default port
    fn sent_by_port(&self, network: TransportKind) -> u16 {
        let ports = self.inner.listen_ports.read();
        ports
            .get(&network)
            .and_then(|ports| ports.choose(&mut rand::thread_rng()).copied())
            .unwrap_or_else(|| network.default_port())
    }
}

impl LayerInner {
    async fn serve(
        self: Arc<Self>,
        mut proto_msgs: mpsc::Receiver<Message>,
        mut proto_errs: mpsc::Receiver<Error>,
        msgs: mpsc::Sender<Message>,
        errs: mpsc::Sender<Error>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(msg) = proto_msgs.recv() => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        sent = msgs.send(msg) => if sent.is_err() {
                            debug!("transport message queue closed");
                        },
                    }
                }
                Some(err) = proto_errs.recv() => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        sent = errs.send(err) => if sent.is_err() {
                            debug!("transport error queue closed");
                        },
                    }
                }
            }
        }

        let protocols: Vec<_> = self.protocols.read().values().cloned().collect();
        for protocol in protocols {
            protocol.done().await;
        }
        drop(msgs);
        drop(errs);
        info!("transport layer stopped");
        self.done.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticResolver;
    use sipflow_sip_core::{Method, Request, Uri};

    fn layer() -> TransportLayer {
        TransportLayer::with_resolver(TransportConfig::default(), Arc::new(StaticResolver::new()))
    }

    #[tokio::test]
    async fn test_send_without_protocol() {
        let layer = layer();
        let req = Request::new(Method::Options, Uri::sip("127.0.0.1", Some(5060)))
            .with_header("Via", "SIP/2.0/UDP 10.0.0.1;branch=z9hG4bKnoproto")
            .with_header("CSeq", "1 OPTIONS");
        let err = layer.send(&req.into()).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedProtocol(TransportKind::Udp)));
        layer.cancel();
        layer.done().await;
    }

    #[tokio::test]
    async fn test_send_requires_via() {
        let layer = layer();
        let req = Request::new(Method::Options, Uri::sip("127.0.0.1", Some(5060)));
        assert!(matches!(layer.send(&req.into()).await, Err(Error::MissingVia)));
        layer.cancel();
    }

    #[tokio::test]
    async fn test_queues_are_taken_once() {
        let layer = layer();
        assert!(layer.take_messages().is_some());
        assert!(layer.take_messages().is_none());
        assert!(layer.take_errors().is_some());
        assert!(layer.take_errors().is_none());
        layer.cancel();
        layer.done().await;
        assert!(matches!(
            layer.listen(TransportKind::Udp, "127.0.0.1:0", &ListenOptions::default()).await,
            Err(Error::LayerCanceled)
        ));
    }

    #[tokio::test]
    async fn test_reliability_by_kind() {
        let layer = layer();
        assert!(!layer.is_reliable(TransportKind::Udp));
        assert!(layer.is_reliable(TransportKind::Tcp));
        assert!(layer.is_streamed(TransportKind::Tls));
        layer.cancel();
    }
}
