//! Parsing and building against RFC 3261 shaped messages.

use sipflow_sip_core::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Compact header names, folded lines, multiple Via values in one header
const COMPACT_INVITE: &str = "INVITE sip:bob@biloxi.example.com SIP/2.0\r\n\
    v: SIP/2.0/UDP client.atlanta.example.com:5060;branch=z9hG4bK74bf9, \r\n \
     SIP/2.0/UDP proxy.atlanta.example.com;branch=z9hG4bKproxy1\r\n\
    Max-Forwards: 70\r\n\
    f: Alice <sip:alice@atlanta.example.com>;tag=9fxced76sl\r\n\
    t: Bob <sip:bob@biloxi.example.com>\r\n\
    i: 3848276298220188511@atlanta.example.com\r\n\
    CSeq: 2 INVITE\r\n\
    m: <sip:alice@client.atlanta.example.com;transport=tcp>\r\n\
    c: application/sdp\r\n\
    l: 5\r\n\
    \r\n\
    v=0\r\n";

fn parse_invite() -> Request {
    match parse_message(COMPACT_INVITE.as_bytes()).unwrap() {
        Message::Request(req) => req,
        other => panic!("expected a request, got {:?}", other),
    }
}

#[test]
fn test_compact_invite() {
    init_tracing();
    let invite = parse_invite();

    assert_eq!(invite.method, Method::Invite);
    assert_eq!(invite.uri.host, "biloxi.example.com");
    assert_eq!(invite.call_id().unwrap(), "3848276298220188511@atlanta.example.com");
    assert_eq!(invite.from_tag().as_deref(), Some("9fxced76sl"));
    assert_eq!(invite.headers.get("Content-Type"), Some("application/sdp"));
    assert_eq!(invite.headers.content_length().unwrap(), Some(5));
    assert_eq!(invite.body.as_ref(), b"v=0\r\n");

    let hops = invite.headers.via_hops().unwrap();
    assert_eq!(hops.len(), 2);
    let top = invite.via_hop().unwrap();
    assert_eq!(top.host, "client.atlanta.example.com");
    assert_eq!(top.port, Some(5060));
    assert_eq!(top.branch(), Some("z9hG4bK74bf9"));
    assert!(top.has_rfc3261_branch());
    assert_eq!(hops[1].branch(), Some("z9hG4bKproxy1"));

    let cseq = invite.cseq().unwrap();
    assert_eq!(cseq.seq, 2);
    assert_eq!(cseq.method, Method::Invite);
}

#[test]
fn test_response_survives_the_wire() {
    let invite = parse_invite();
    let busy = Response::from_request(&invite, status::BUSY_HERE, None);

    let parsed = match parse_message(&busy.to_bytes()).unwrap() {
        Message::Response(res) => res,
        other => panic!("expected a response, got {:?}", other),
    };
    assert_eq!(parsed.status, 486);
    assert_eq!(parsed.reason, "Busy Here");
    assert_eq!(parsed.headers.via_hops().unwrap().len(), 2);
    assert_eq!(parsed.via_hop().unwrap().branch(), Some("z9hG4bK74bf9"));
    assert_eq!(parsed.call_id().unwrap(), invite.call_id().unwrap());
    assert_eq!(parsed.cseq().unwrap(), invite.cseq().unwrap());
}

#[test]
fn test_ack_and_cancel_follow_the_invite() {
    let invite = parse_invite();
    let mut busy = Response::from_request(&invite, status::BUSY_HERE, None);
    busy.headers.set("To", "Bob <sip:bob@biloxi.example.com>;tag=8321234356");

    let ack = Request::ack_for(&invite, &busy).unwrap();
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(ack.uri, invite.uri);
    assert_eq!(ack.headers.via_hops().unwrap().len(), 1);
    assert_eq!(ack.via_hop().unwrap().branch(), Some("z9hG4bK74bf9"));
    assert_eq!(ack.headers.to_tag().as_deref(), Some("8321234356"));
    assert_eq!(ack.cseq().unwrap(), CSeq::new(2, Method::Ack));

    let cancel = Request::cancel_for(&invite).unwrap();
    assert_eq!(cancel.method, Method::Cancel);
    assert_eq!(cancel.via_hop().unwrap().branch(), Some("z9hG4bK74bf9"));
    assert_eq!(cancel.headers.to_tag(), None);
    assert_eq!(cancel.cseq().unwrap(), CSeq::new(2, Method::Cancel));

    // Both reparse cleanly
    for req in [ack, cancel] {
        assert!(parse_message(&req.to_bytes()).unwrap().is_request());
    }
}

#[test]
fn test_stream_framing_requires_content_length() {
    let mut parser = StreamParser::new();
    parser.feed(b"\r\n\r\n");
    parser.feed(COMPACT_INVITE.as_bytes());
    let first = parser.next_message().unwrap().unwrap();
    assert_eq!(first.method(), Some(Method::Invite));

    parser.feed(b"OPTIONS sip:bob@biloxi.example.com SIP/2.0\r\nCSeq: 1 OPTIONS\r\n\r\n");
    assert!(parser.next_message().unwrap().unwrap_err().is_malformed());
}
