//! The transport seen by transactions.

use async_trait::async_trait;
use sipflow_sip_core::{Message, TransportKind};
use sipflow_sip_transport::TransportLayer;

/// Sending side of a transport as used by transactions.
///
/// Implemented by [`TransportLayer`]; tests use
/// [`MockTransport`](crate::testing::MockTransport).
#[async_trait]
pub trait TxTransport: Send + Sync + 'static {
    async fn send(&self, msg: &Message) -> sipflow_sip_transport::Result<()>;

    /// Whether `network` is reliable; retransmission timers are skipped when it is.
    fn is_reliable(&self, network: TransportKind) -> bool;
}

#[async_trait]
impl TxTransport for TransportLayer {
    async fn send(&self, msg: &Message) -> sipflow_sip_transport::Result<()> {
        TransportLayer::send(self, msg).await
    }

    fn is_reliable(&self, network: TransportKind) -> bool {
        TransportLayer::is_reliable(self, network)
    }
}
