//! Routing of inbound messages that match no transaction, plus the
//! request helpers built on the layer.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sipflow_sip_core::{Message, Method, Request, Response};
use sipflow_transaction_core::testing::{mock_layer, MockTransport};
use sipflow_transaction_core::{
    request_with_cancellation, Error, RequestDispatcher, TransactionConfig, TransactionLayer,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use common::{incoming, init_tracing, outgoing};

/// Next request of `method` sent through `transport`
async fn next_request(transport: &MockTransport, method: Method) -> Request {
    loop {
        match transport.next_sent().await.map(|s| s.message) {
            Some(Message::Request(req)) if req.method == method => return req,
            Some(_) => continue,
            None => panic!("mock transport closed"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_cancel_gets_481() {
    init_tracing();
    let transport = MockTransport::new();
    let (layer, inbound) = mock_layer(transport.clone(), TransactionConfig::default());
    let mut requests = layer.take_requests().unwrap();

    inbound
        .send(incoming(Method::Cancel, "z9hG4bKnowhere", "layer-1").into())
        .await
        .unwrap();
    let sent = transport.next_sent().await.unwrap();
    match sent.message {
        Message::Response(res) => {
            assert_eq!(res.status, 481);
            assert_eq!(res.reason, "Transaction Does Not Exist");
            assert_eq!(res.cseq().unwrap().method, Method::Cancel);
        }
        other => panic!("expected 481, got {:?}", other),
    }
    assert!(layer.is_empty());
    assert!(requests.try_recv().is_err());

    layer.cancel();
    layer.done().await;
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_ack_and_response_are_passed_up() {
    let transport = MockTransport::new();
    let (layer, inbound) = mock_layer(transport.clone(), TransactionConfig::default());
    let mut acks = layer.take_acks().unwrap();
    let mut responses = layer.take_responses().unwrap();

    // ACK for a 2xx carries a branch of its own
    inbound
        .send(incoming(Method::Ack, "z9hG4bKack2xx", "layer-2").into())
        .await
        .unwrap();
    let ack = acks.recv().await.unwrap();
    assert_eq!(ack.call_id().unwrap(), "layer-2");

    let stray = Response::from_request(&incoming(Method::Invite, "z9hG4bKstray", "layer-2"), 200, None);
    inbound.send(stray.into()).await.unwrap();
    let res = responses.recv().await.unwrap();
    assert_eq!(res.status, 200);

    assert!(layer.is_empty());
    assert!(transport.sent().is_empty());

    layer.cancel();
    layer.done().await;
    assert!(acks.recv().await.is_none());
    assert!(responses.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_request_without_via_is_reported() {
    let transport = MockTransport::new();
    let (layer, inbound) = mock_layer(transport.clone(), TransactionConfig::default());
    let mut errors = layer.take_errors().unwrap();

    let mut req = incoming(Method::Options, "z9hG4bKunused", "layer-3");
    req.headers.remove("Via");
    inbound.send(req.into()).await.unwrap();

    assert!(matches!(errors.recv().await.unwrap(), Error::Key { .. }));
    assert!(layer.is_empty());

    layer.cancel();
    layer.done().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_terminates_transactions() {
    let transport = MockTransport::new();
    let (layer, inbound) = mock_layer(transport.clone(), TransactionConfig::default());
    let mut requests = layer.take_requests().unwrap();

    let client = layer.request(outgoing(Method::Invite, "layer-4")).await.unwrap();
    inbound
        .send(incoming(Method::Invite, "z9hG4bKshutdown", "layer-4").into())
        .await
        .unwrap();
    let server = requests.recv().await.unwrap();
    assert_eq!(layer.len(), 2);

    layer.cancel();
    layer.done().await;
    assert!(client.is_done());
    assert!(server.is_done());
    assert!(layer.is_empty());
    assert!(requests.recv().await.is_none());
    assert!(matches!(
        layer.request(outgoing(Method::Options, "layer-4")).await,
        Err(Error::LayerCanceled)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_request_with_cancellation_success() {
    let transport = MockTransport::new();
    let (layer, inbound) = mock_layer(transport.clone(), TransactionConfig::default());

    let peer = tokio::spawn({
        let transport = transport.clone();
        async move {
            let invite = next_request(&transport, Method::Invite).await;
            for status in [180, 180, 183, 200] {
                sleep(Duration::from_millis(100)).await;
                inbound.send(Response::from_request(&invite, status, None).into()).await.unwrap();
            }
        }
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let res = request_with_cancellation(
        &layer,
        outgoing(Method::Invite, "layer-5"),
        CancellationToken::new(),
        {
            let seen = seen.clone();
            move |res: &Response| seen.lock().push(res.status)
        },
    )
    .await
    .unwrap();

    assert_eq!(res.status, 200);
    assert_eq!(*seen.lock(), vec![180, 183]);
    peer.await.unwrap();

    layer.cancel();
    layer.done().await;
}

#[tokio::test(start_paused = true)]
async fn test_request_with_cancellation_sends_cancel() {
    let transport = MockTransport::new();
    let (layer, inbound) = mock_layer(transport.clone(), TransactionConfig::default());
    let token = CancellationToken::new();

    let peer = tokio::spawn({
        let transport = transport.clone();
        let token = token.clone();
        async move {
            let invite = next_request(&transport, Method::Invite).await;
            inbound.send(Response::from_request(&invite, 180, None).into()).await.unwrap();
            sleep(Duration::from_millis(100)).await;
            token.cancel();

            let cancel = next_request(&transport, Method::Cancel).await;
            inbound.send(Response::from_request(&cancel, 200, None).into()).await.unwrap();
            inbound.send(Response::from_request(&invite, 487, None).into()).await.unwrap();
        }
    });

    let err = request_with_cancellation(&layer, outgoing(Method::Invite, "layer-6"), token, |_| {})
        .await
        .unwrap_err();
    assert_eq!(
        err,
        Error::RequestFailed {
            status: 487,
            reason: "Request Terminated".to_string()
        }
    );
    peer.await.unwrap();
    assert_eq!(transport.sent_requests(&Method::Cancel).len(), 1);
    assert_eq!(transport.sent_requests(&Method::Ack).len(), 1);

    layer.cancel();
    layer.done().await;
}

#[tokio::test(start_paused = true)]
async fn test_request_with_cancellation_times_out() {
    let transport = MockTransport::new();
    let (layer, _inbound) = mock_layer(transport.clone(), TransactionConfig::default());

    let err = request_with_cancellation(&layer, outgoing(Method::Options, "layer-7"), CancellationToken::new(), |_| {})
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{}", err);

    layer.cancel();
    layer.done().await;
}

fn serve_dispatcher(layer: &TransactionLayer) -> tokio::task::JoinHandle<()> {
    let responder = layer.clone();
    let dispatcher = RequestDispatcher::new().on(Method::Options, move |req, _tx| {
        let layer = responder.clone();
        async move {
            layer.respond(Response::from_request(&req, 200, None)).await.unwrap();
        }
    });
    let layer = layer.clone();
    tokio::spawn(async move {
        Arc::new(dispatcher).serve(layer).await.unwrap();
    })
}

#[tokio::test(start_paused = true)]
async fn test_dispatcher_answers_registered_and_unknown_methods() {
    let transport = MockTransport::new();
    let (layer, inbound) = mock_layer(transport.clone(), TransactionConfig::default());
    let serving = serve_dispatcher(&layer);

    inbound
        .send(incoming(Method::Options, "z9hG4bKdispatch1", "layer-8").into())
        .await
        .unwrap();
    inbound
        .send(incoming(Method::Subscribe, "z9hG4bKdispatch2", "layer-8").into())
        .await
        .unwrap();
    inbound
        .send(incoming(Method::Ack, "z9hG4bKdispatch3", "layer-8").into())
        .await
        .unwrap();

    let mut statuses = Vec::new();
    while statuses.len() < 2 {
        if let Some(Message::Response(res)) = transport.next_sent().await.map(|s| s.message) {
            if res.status == 405 {
                assert_eq!(res.headers.get("Allow"), Some("OPTIONS"));
            }
            statuses.push(res.status);
        }
    }
    statuses.sort_unstable();
    assert_eq!(statuses, vec![200, 405]);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.sent().len(), 2);

    layer.cancel();
    layer.done().await;
    serving.await.unwrap();
}
