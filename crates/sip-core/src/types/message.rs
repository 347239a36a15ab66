use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::types::cseq::CSeq;
use crate::types::headers::Headers;
use crate::types::method::Method;
use crate::types::sip_request::Request;
use crate::types::sip_response::Response;
use crate::types::transport::TransportKind;
use crate::types::via::ViaHop;

/// Either kind of SIP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(req) => &req.headers,
            Message::Response(res) => &res.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Message::Request(req) => &mut req.headers,
            Message::Response(res) => &mut res.headers,
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            Message::Request(req) => &req.body,
            Message::Response(res) => &res.body,
        }
    }

    pub fn set_body(&mut self, body: Bytes) {
        match self {
            Message::Request(req) => req.body = body,
            Message::Response(res) => res.body = body,
        }
    }

    pub fn via_hop(&self) -> Result<ViaHop> {
        self.headers().top_via()
    }

    pub fn set_via_hop(&mut self, hop: &ViaHop) {
        self.headers_mut().set_top_via(hop);
    }

    pub fn cseq(&self) -> Result<CSeq> {
        self.headers().cseq()
    }

    pub fn call_id(&self) -> Result<&str> {
        self.headers().call_id()
    }

    pub fn from_tag(&self) -> Option<String> {
        self.headers().from_tag()
    }

    /// Request method, or the CSeq method of a response
    pub fn method(&self) -> Option<Method> {
        match self {
            Message::Request(req) => Some(req.method.clone()),
            Message::Response(res) => res.cseq().ok().map(|cseq| cseq.method),
        }
    }

    pub fn transport(&self) -> TransportKind {
        match self {
            Message::Request(req) => req.transport(),
            Message::Response(res) => res.transport(),
        }
    }

    pub fn set_transport(&mut self, transport: TransportKind) {
        match self {
            Message::Request(req) => req.set_transport(transport),
            Message::Response(res) => res.set_transport(transport),
        }
    }

    pub fn source(&self) -> Option<String> {
        match self {
            Message::Request(req) => req.source(),
            Message::Response(res) => res.source(),
        }
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        match self {
            Message::Request(req) => req.set_source(source),
            Message::Response(res) => res.set_source(source),
        }
    }

    pub fn destination(&self) -> Option<String> {
        match self {
            Message::Request(req) => Some(req.destination()),
            Message::Response(res) => res.destination(),
        }
    }

    pub fn set_destination(&mut self, destination: impl Into<String>) {
        match self {
            Message::Request(req) => req.set_destination(destination),
            Message::Response(res) => res.set_destination(destination),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Message::Request(req) => req.to_bytes(),
            Message::Response(res) => res.to_bytes(),
        }
    }

    pub fn short(&self) -> String {
        match self {
            Message::Request(req) => req.short(),
            Message::Response(res) => res.short(),
        }
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Response> for Message {
    fn from(res: Response) -> Self {
        Message::Response(res)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(req) => fmt::Display::fmt(req, f),
            Message::Response(res) => fmt::Display::fmt(res, f),
        }
    }
}

/// Serialize a start line, headers and body. Any Content-Length header in
/// `headers` is replaced by the actual body length.
pub(crate) fn write_message(start_line: &str, headers: &Headers, body: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(256 + body.len());
    buf.put_slice(start_line.as_bytes());
    buf.put_slice(b"\r\n");
    for header in headers.iter() {
        if header.name.eq_ignore_ascii_case("Content-Length") || header.name.eq_ignore_ascii_case("l") {
            continue;
        }
        buf.put_slice(header.name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(header.value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    buf.put_slice(body);
    buf.freeze()
}
