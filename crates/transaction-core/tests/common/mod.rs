//! Helpers shared by the transaction scenario tests.

#![allow(dead_code)]

use std::time::Duration;

use sipflow_sip_core::{Method, Request, Uri};
use sipflow_transaction_core::testing::SentMessage;
use sipflow_transaction_core::TransactionLayer;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Outgoing request without a Via; the client transaction adds one
pub fn outgoing(method: Method, call_id: &str) -> Request {
    let cseq = format!("1 {}", method);
    Request::new(method, Uri::sip("192.0.2.10", Some(5060)).with_user("bob"))
        .with_header("Max-Forwards", "70")
        .with_header("From", "<sip:alice@example.com>;tag=alice1")
        .with_header("To", "<sip:bob@example.com>")
        .with_header("Call-ID", call_id)
        .with_header("CSeq", cseq)
}

/// Request as received from a peer at 192.0.2.20:5070
pub fn incoming(method: Method, branch: &str, call_id: &str) -> Request {
    let cseq = format!("1 {}", method);
    Request::new(method, Uri::sip("127.0.0.1", Some(5060)).with_user("bob"))
        .with_header("Via", format!("SIP/2.0/UDP 192.0.2.20:5070;branch={}", branch))
        .with_header("Max-Forwards", "70")
        .with_header("From", "<sip:carol@example.com>;tag=carol1")
        .with_header("To", "<sip:bob@example.com>")
        .with_header("Call-ID", call_id)
        .with_header("CSeq", cseq)
}

/// Milliseconds between consecutive sends
pub fn intervals(sent: &[SentMessage]) -> Vec<u64> {
    sent.windows(2)
        .map(|pair| (pair[1].at - pair[0].at).as_millis() as u64)
        .collect()
}

/// Assert `actual` matches `expected` within a few milliseconds per entry
pub fn assert_intervals(actual: &[u64], expected: &[u64]) {
    assert!(
        actual.len() >= expected.len(),
        "expected at least {} intervals, got {:?}",
        expected.len(),
        actual
    );
    for (a, e) in actual.iter().zip(expected) {
        assert!(a.abs_diff(*e) <= 5, "intervals {:?} do not match {:?}", actual, expected);
    }
}

/// Assert `actual` is `expected` give or take a few milliseconds
pub fn assert_close(actual: Duration, expected: Duration) {
    let diff = if actual > expected { actual - expected } else { expected - actual };
    assert!(diff <= Duration::from_millis(5), "{:?} is not close to {:?}", actual, expected);
}

/// Wait until the layer has dropped every finished transaction
pub async fn wait_empty(layer: &TransactionLayer) {
    for _ in 0..100 {
        if layer.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("transaction layer still holds {} transactions", layer.len());
}
