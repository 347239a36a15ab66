//! UDP transport tests
//!
//! Two transport layers on loopback exchanging requests and responses, plus
//! raw datagrams injected from a plain socket to exercise inbound handling.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};

use sipflow_sip_core::{generate_branch, Message, Method, Request, Response, TransportKind, Uri, ViaHop};
use sipflow_sip_transport::{
    ListenOptions, SrvRecord, StaticResolver, TransportConfig, TransportLayer,
};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn layer() -> TransportLayer {
    TransportLayer::with_resolver(TransportConfig::default(), Arc::new(StaticResolver::new()))
}

fn options_to(uri: Uri, call_id: &str) -> Request {
    Request::new(Method::Options, uri)
        .with_header("Via", ViaHop::new("UDP", "0.0.0.0", None).with_branch(generate_branch()).to_string())
        .with_header("Max-Forwards", "70")
        .with_header("From", "<sip:alice@example.com>;tag=udp1")
        .with_header("To", "<sip:bob@example.com>")
        .with_header("Call-ID", call_id)
        .with_header("CSeq", "1 OPTIONS")
}

fn raw_request(call_id: &str, extra: &str, body: &str) -> String {
    format!(
        "INVITE sip:bob@127.0.0.1 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:5999;branch=z9hG4bKraw{call_id}\r\n\
         From: <sip:alice@example.com>;tag=raw\r\n\
         To: <sip:bob@example.com>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         {extra}\r\n{body}"
    )
}

#[tokio::test]
async fn test_request_response_roundtrip() -> anyhow::Result<()> {
    init_tracing();
    let alice = layer();
    let bob = layer();
    let alice_addr = alice.listen(TransportKind::Udp, "127.0.0.1:0", &ListenOptions::default()).await?;
    let bob_addr = bob.listen(TransportKind::Udp, "127.0.0.1:0", &ListenOptions::default()).await?;
    let mut alice_msgs = alice.take_messages().unwrap();
    let mut bob_msgs = bob.take_messages().unwrap();

    let req = options_to(Uri::sip("127.0.0.1", Some(bob_addr.port())), "udp-roundtrip");
    alice.send(&req.into()).await?;

    let received = timeout(WAIT, bob_msgs.recv()).await?.unwrap();
    let Message::Request(received) = received else {
        panic!("expected a request");
    };
    assert_eq!(received.call_id()?, "udp-roundtrip");
    assert_eq!(received.transport(), TransportKind::Udp);
    assert_eq!(received.source(), Some(format!("127.0.0.1:{}", alice_addr.port())));
    assert_eq!(received.destination(), bob_addr.to_string());

    // The Via was rewritten to alice's listening address.
    let hop = received.via_hop()?;
    assert_eq!(hop.host, "127.0.0.1");
    assert_eq!(hop.port, Some(alice_addr.port()));
    assert_eq!(hop.received(), None);

    let res = Response::from_request(&received, 200, None);
    bob.send(&res.into()).await?;

    let reply = timeout(WAIT, alice_msgs.recv()).await?.unwrap();
    let Message::Response(reply) = reply else {
        panic!("expected a response");
    };
    assert_eq!(reply.status, 200);
    assert_eq!(reply.call_id()?, "udp-roundtrip");

    alice.cancel();
    bob.cancel();
    alice.done().await;
    bob.done().await;
    Ok(())
}

#[tokio::test]
async fn test_broken_datagram_is_reported_and_listener_survives() -> anyhow::Result<()> {
    init_tracing();
    let layer = layer();
    let addr = layer.listen(TransportKind::Udp, "127.0.0.1:0", &ListenOptions::default()).await?;
    let mut msgs = layer.take_messages().unwrap();
    let mut errors = layer.take_errors().unwrap();

    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let broken = raw_request("broken", "Content-Type: application/sdp\r\nContent-Length: 500\r\n", "v=0\r\n");
    peer.send_to(broken.as_bytes(), addr).await?;

    let err = timeout(WAIT, errors.recv()).await?.unwrap();
    assert!(err.is_broken(), "unexpected error: {}", err);

    let valid = raw_request("after-broken", "Content-Length: 0\r\n", "");
    peer.send_to(valid.as_bytes(), addr).await?;
    let msg = timeout(WAIT, msgs.recv()).await?.unwrap();
    assert_eq!(msg.call_id()?, "after-broken");

    layer.cancel();
    layer.done().await;
    Ok(())
}

#[tokio::test]
async fn test_noise_is_dropped_silently() -> anyhow::Result<()> {
    init_tracing();
    let layer = layer();
    let addr = layer.listen(TransportKind::Udp, "127.0.0.1:0", &ListenOptions::default()).await?;
    let mut msgs = layer.take_messages().unwrap();
    let mut errors = layer.take_errors().unwrap();

    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    peer.send_to(b"\r\n\r\n", addr).await?;
    peer.send_to(&[0u8; 4], addr).await?;
    peer.send_to(b"hello there\r\n\r\n", addr).await?;
    let no_via = "OPTIONS sip:bob@127.0.0.1 SIP/2.0\r\nCall-ID: no-via\r\nCSeq: 1 OPTIONS\r\n\r\n";
    peer.send_to(no_via.as_bytes(), addr).await?;
    let valid = raw_request("after-noise", "", "");
    peer.send_to(valid.as_bytes(), addr).await?;

    let msg = timeout(WAIT, msgs.recv()).await?.unwrap();
    assert_eq!(msg.call_id()?, "after-noise");
    // No rport: replies go to the source IP and the Via port.
    assert_eq!(msg.source().as_deref(), Some("127.0.0.1:5999"));
    assert!(errors.try_recv().is_err());

    layer.cancel();
    layer.done().await;
    Ok(())
}

#[tokio::test]
async fn test_rport_and_received_are_stamped() -> anyhow::Result<()> {
    init_tracing();
    let layer = layer();
    let addr = layer.listen(TransportKind::Udp, "127.0.0.1:0", &ListenOptions::default()).await?;
    let mut msgs = layer.take_messages().unwrap();

    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let req = raw_request("rport", "", "").replace(
        "Via: SIP/2.0/UDP 127.0.0.1:5999",
        "Via: SIP/2.0/UDP 192.0.2.10:5999;rport",
    );
    peer.send_to(req.as_bytes(), addr).await?;

    let msg = timeout(WAIT, msgs.recv()).await?.unwrap();
    let hop = msg.via_hop()?;
    let peer_port = peer.local_addr()?.port().to_string();
    assert_eq!(hop.received(), Some("127.0.0.1"));
    assert_eq!(hop.params.get("rport"), Some(peer_port.as_str()));
    assert_eq!(msg.source(), Some(peer.local_addr()?.to_string()));

    layer.cancel();
    layer.done().await;
    Ok(())
}

#[tokio::test]
async fn test_srv_resolution_and_transport_param() -> anyhow::Result<()> {
    init_tracing();
    let bob = layer();
    let bob_addr = bob.listen(TransportKind::Udp, "127.0.0.1:0", &ListenOptions::default()).await?;
    let mut bob_msgs = bob.take_messages().unwrap();

    let resolver = Arc::new(StaticResolver::new());
    resolver.add_srv(
        "_sip._udp.bob.test",
        SrvRecord {
            priority: 0,
            weight: 0,
            port: bob_addr.port(),
            target: "host.bob.test.".to_string(),
        },
    );
    resolver.add_host("host.bob.test", "127.0.0.1".parse()?);
    let alice = TransportLayer::with_resolver(TransportConfig::default(), resolver);
    alice.listen(TransportKind::Udp, "127.0.0.1:0", &ListenOptions::default()).await?;

    let uri = Uri::sip("bob.test", None).with_user("bob").with_param("transport", Some("udp"));
    alice.send(&options_to(uri, "srv").into()).await?;

    let msg = timeout(WAIT, bob_msgs.recv()).await?.unwrap();
    let Message::Request(req) = msg else {
        panic!("expected a request");
    };
    assert_eq!(req.call_id()?, "srv");
    assert!(!req.uri.params.contains("transport"));

    alice.cancel();
    bob.cancel();
    Ok(())
}

#[tokio::test]
async fn test_host_without_srv_resolves_through_injected_resolver() -> anyhow::Result<()> {
    init_tracing();
    let bob = layer();
    let bob_addr = bob.listen(TransportKind::Udp, "127.0.0.1:0", &ListenOptions::default()).await?;
    let mut bob_msgs = bob.take_messages().unwrap();

    // No SRV records, only an address record the system resolver cannot know
    let resolver = Arc::new(StaticResolver::new());
    resolver.add_host("bob.lab.invalid", "127.0.0.1".parse()?);
    let alice = TransportLayer::with_resolver(TransportConfig::default(), resolver);
    alice.listen(TransportKind::Udp, "127.0.0.1:0", &ListenOptions::default()).await?;

    let uri = Uri::sip("bob.lab.invalid", Some(bob_addr.port())).with_user("bob");
    alice.send(&options_to(uri, "a-record").into()).await?;

    let msg = timeout(WAIT, bob_msgs.recv()).await?.unwrap();
    assert_eq!(msg.call_id()?, "a-record");

    let unknown = Uri::sip("nobody.lab.invalid", Some(bob_addr.port()));
    assert!(alice.send(&options_to(unknown, "unknown").into()).await.is_err());

    alice.cancel();
    bob.cancel();
    Ok(())
}

#[tokio::test]
async fn test_send_from_unknown_port_fails() -> anyhow::Result<()> {
    let layer = layer();
    layer.listen(TransportKind::Udp, "127.0.0.1:0", &ListenOptions::default()).await?;

    let target: SocketAddr = "127.0.0.1:9".parse()?;
    let mut req = options_to(Uri::sip("127.0.0.1", Some(target.port())), "bad-port");
    let mut hop = req.via_hop()?;
    hop.port = Some(1);
    req.set_via_hop(&hop);

    let err = layer.send(&req.into()).await.unwrap_err();
    assert!(err.to_string().contains("connection on port 1"), "{}", err);
    layer.cancel();
    Ok(())
}
