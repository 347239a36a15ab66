use std::fmt;

use bytes::Bytes;

use crate::error::Result;
use crate::types::cseq::CSeq;
use crate::types::headers::Headers;
use crate::types::host::join_host_port;
use crate::types::message::write_message;
use crate::types::method::Method;
use crate::types::sip_request::Request;
use crate::types::status::reason_phrase;
use crate::types::transport::TransportKind;
use crate::types::via::ViaHop;

/// A SIP response plus transport metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
    transport: Option<TransportKind>,
    source: Option<String>,
    destination: Option<String>,
}

impl Response {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Response {
            version: "SIP/2.0".to_string(),
            status,
            reason: reason.into(),
            headers: Headers::new(),
            body: Bytes::new(),
            transport: None,
            source: None,
            destination: None,
        }
    }

    /// Build a response to `req` (RFC 3261 8.2.6.2).
    ///
    /// Via, From, To, Call-ID and CSeq are copied. The response goes back out
    /// on the request's transport, from the address the request arrived on to
    /// the address it came from.
    pub fn from_request(req: &Request, status: u16, reason: Option<&str>) -> Self {
        let mut res = Response::new(status, reason.unwrap_or_else(|| reason_phrase(status)));
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            for value in req.headers.get_all(name) {
                res.headers.push(name, value);
            }
        }
        res.transport = Some(req.transport());
        res.source = Some(req.destination());
        res.destination = req.source();
        res
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Explicit transport, else the top Via transport, else UDP
    pub fn transport(&self) -> TransportKind {
        self.transport
            .or_else(|| self.via_hop().ok().and_then(|hop| hop.transport.parse().ok()))
            .unwrap_or(TransportKind::Udp)
    }

    pub fn set_transport(&mut self, transport: TransportKind) {
        self.transport = Some(transport);
    }

    pub fn source(&self) -> Option<String> {
        self.source.clone()
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = Some(source.into());
    }

    /// Where the response is sent; falls back to the top Via (RFC 3261 18.2.2)
    pub fn destination(&self) -> Option<String> {
        if let Some(destination) = &self.destination {
            return Some(destination.clone());
        }
        let hop = self.via_hop().ok()?;
        let host = hop.received().map(str::to_string).unwrap_or_else(|| hop.host.clone());
        let port = hop
            .params
            .get("rport")
            .and_then(|p| p.parse::<u16>().ok())
            .or(hop.port)
            .unwrap_or_else(|| self.transport().default_port());
        Some(join_host_port(&host, Some(port)))
    }

    pub fn set_destination(&mut self, destination: impl Into<String>) {
        self.destination = Some(destination.into());
    }

    pub fn via_hop(&self) -> Result<ViaHop> {
        self.headers.top_via()
    }

    pub fn cseq(&self) -> Result<CSeq> {
        self.headers.cseq()
    }

    pub fn call_id(&self) -> Result<&str> {
        self.headers.call_id()
    }

    pub fn from_tag(&self) -> Option<String> {
        self.headers.from_tag()
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 300-699
    pub fn is_error(&self) -> bool {
        self.status >= 300
    }

    /// Response to a CANCEL request
    pub fn is_cancel(&self) -> bool {
        self.cseq().map_or(false, |cseq| cseq.method == Method::Cancel)
    }

    pub fn start_line(&self) -> String {
        format!("{} {} {}", self.version, self.status, self.reason)
    }

    pub fn to_bytes(&self) -> Bytes {
        write_message(&self.start_line(), &self.headers, &self.body)
    }

    pub fn short(&self) -> String {
        format!(
            "{} (cseq: {}, call-id: {})",
            self.start_line(),
            self.headers.get("CSeq").unwrap_or("-"),
            self.headers.get("Call-ID").unwrap_or("-")
        )
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}
