//! Both layers over real UDP sockets on loopback.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use sipflow_sip_core::{Method, Request, Response, TransportKind, Uri};
use sipflow_sip_transport::{ListenOptions, StaticResolver, TransportConfig, TransportLayer};
use sipflow_transaction_core::{
    request_with_cancellation, RequestDispatcher, TransactionConfig, TransactionLayer,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use common::init_tracing;

const WAIT: Duration = Duration::from_secs(5);

async fn stack() -> anyhow::Result<(TransportLayer, TransactionLayer, u16)> {
    let transport = TransportLayer::with_resolver(TransportConfig::default(), Arc::new(StaticResolver::new()));
    let addr = transport
        .listen(TransportKind::Udp, "127.0.0.1:0", &ListenOptions::default())
        .await?;
    let layer = TransactionLayer::new(transport.clone(), TransactionConfig::default())?;
    Ok((transport, layer, addr.port()))
}

async fn shutdown(transport: &TransportLayer, layer: &TransactionLayer) {
    layer.cancel();
    layer.done().await;
    transport.cancel();
    transport.done().await;
}

#[tokio::test]
#[serial]
async fn test_options_over_udp() -> anyhow::Result<()> {
    init_tracing();
    let (server_transport, server, server_port) = stack().await?;
    let (client_transport, client, _) = stack().await?;

    let responder = server.clone();
    let dispatcher = RequestDispatcher::new().on(Method::Options, move |req, _tx| {
        let layer = responder.clone();
        async move {
            let res = Response::from_request(&req, 200, None).with_header("Accept", "application/sdp");
            if let Err(e) = layer.respond(res).await {
                panic!("responding to OPTIONS failed: {}", e);
            }
        }
    });
    let serving = tokio::spawn(Arc::new(dispatcher).serve(server.clone()));

    let req = Request::new(Method::Options, Uri::sip("127.0.0.1", Some(server_port)))
        .with_header("Max-Forwards", "70")
        .with_header("From", "<sip:alice@example.com>;tag=udpstack")
        .with_header("To", "<sip:bob@example.com>")
        .with_header("Call-ID", "udp-stack-1")
        .with_header("CSeq", "1 OPTIONS");

    let res = timeout(
        WAIT,
        request_with_cancellation(&client, req, CancellationToken::new(), |_| {}),
    )
    .await??;
    assert_eq!(res.status, 200);
    assert_eq!(res.call_id()?, "udp-stack-1");
    assert_eq!(res.headers.get("Accept"), Some("application/sdp"));

    // Both sides keep their transaction until Timer K / Timer J
    assert_eq!(client.len(), 1);
    assert_eq!(server.len(), 1);

    shutdown(&client_transport, &client).await;
    shutdown(&server_transport, &server).await;
    timeout(WAIT, serving).await???;
    assert!(client.is_empty() && server.is_empty());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_invite_over_udp_stops_retransmitting_after_trying() -> anyhow::Result<()> {
    init_tracing();
    let (server_transport, server, server_port) = stack().await?;
    let (client_transport, client, _) = stack().await?;
    let mut requests = server.take_requests().unwrap();

    let invite = Request::new(Method::Invite, Uri::sip("127.0.0.1", Some(server_port)).with_user("bob"))
        .with_header("Max-Forwards", "70")
        .with_header("From", "<sip:alice@example.com>;tag=udpinvite")
        .with_header("To", "<sip:bob@example.com>")
        .with_header("Call-ID", "udp-stack-invite")
        .with_header("CSeq", "1 INVITE")
        .with_header("Contact", "<sip:alice@127.0.0.1>");
    let tx = client.request(invite).await?;
    let mut responses = tx.take_responses().unwrap();

    let incoming = timeout(WAIT, requests.recv()).await?.unwrap();
    assert!(incoming.is_invite());

    // Left unanswered, the server sends 100 Trying on its own
    let trying = timeout(WAIT, responses.recv()).await?.unwrap();
    assert_eq!(trying.status, 100);

    // Past Timer A; a retransmitted INVITE would draw a second 100
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(responses.try_recv().is_err());

    let ok = Response::from_request(incoming.origin(), 200, None)
        .with_header("Contact", format!("<sip:bob@127.0.0.1:{}>", server_port));
    server.respond(ok).await?;

    let ok = timeout(WAIT, responses.recv()).await?.unwrap();
    assert_eq!(ok.status, 200);
    assert_eq!(ok.call_id()?, "udp-stack-invite");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(responses.try_recv().is_err());
    assert!(requests.try_recv().is_err());
    assert_eq!(server.len(), 1);

    shutdown(&client_transport, &client).await;
    shutdown(&server_transport, &server).await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_layer_stops_with_its_transport() -> anyhow::Result<()> {
    let (transport, layer, _) = stack().await?;
    assert!(TransactionLayer::new(transport.clone(), TransactionConfig::default()).is_err());

    transport.cancel();
    transport.done().await;
    timeout(WAIT, layer.done()).await?;
    assert!(layer.is_canceled());
    Ok(())
}
