//! In-process transport for exercising transactions without sockets.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sipflow_sip_core::{Message, Method, TransportKind};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::TransactionConfig;
use crate::layer::TransactionLayer;
use crate::transport::TxTransport;

/// A message handed to [`MockTransport::send`]
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub at: Instant,
    pub message: Message,
}

/// Records everything sent through it and can be told to fail.
pub struct MockTransport {
    reliable: bool,
    failing: AtomicBool,
    sent: Mutex<Vec<SentMessage>>,
    notify_tx: mpsc::UnboundedSender<SentMessage>,
    notify_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SentMessage>>,
}

impl MockTransport {
    /// Unreliable transport, like UDP
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    /// Reliable transport, like TCP
    pub fn reliable() -> Arc<Self> {
        Self::build(true)
    }

    fn build(reliable: bool) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Arc::new(MockTransport {
            reliable,
            failing: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            notify_tx,
            notify_rx: tokio::sync::Mutex::new(notify_rx),
        })
    }

    /// Make subsequent sends fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Everything sent so far, oldest first
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// Sent requests with `method`
    pub fn sent_requests(&self, method: &Method) -> Vec<SentMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|s| matches!(&s.message, Message::Request(req) if &req.method == method))
            .cloned()
            .collect()
    }

    /// Status codes of the sent responses, in order
    pub fn sent_statuses(&self) -> Vec<u16> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match &s.message {
                Message::Response(res) => Some(res.status),
                Message::Request(_) => None,
            })
            .collect()
    }

    /// Wait for the next message sent after the previous call returned
    pub async fn next_sent(&self) -> Option<SentMessage> {
        self.notify_rx.lock().await.recv().await
    }
}

#[async_trait]
impl TxTransport for MockTransport {
    async fn send(&self, msg: &Message) -> sipflow_sip_transport::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(sipflow_sip_transport::Error::Network {
                op: "write",
                network: msg.transport(),
                local: "mock".to_string(),
                remote: msg.destination().unwrap_or_default(),
                source: io::Error::new(io::ErrorKind::BrokenPipe, "mock transport failure"),
            });
        }
        let sent = SentMessage {
            at: Instant::now(),
            message: msg.clone(),
        };
        self.sent.lock().push(sent.clone());
        let _ = self.notify_tx.send(sent);
        Ok(())
    }

    fn is_reliable(&self, _network: TransportKind) -> bool {
        self.reliable
    }
}

/// A transaction layer over `transport` plus the sender feeding its inbound queue
pub fn mock_layer(
    transport: Arc<MockTransport>,
    config: TransactionConfig,
) -> (TransactionLayer, mpsc::Sender<Message>) {
    let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity.max(1));
    let layer = TransactionLayer::with_transport(transport, inbound_rx, config);
    (layer, inbound_tx)
}
