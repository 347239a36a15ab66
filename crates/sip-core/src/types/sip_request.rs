use std::fmt;

use bytes::Bytes;

use crate::error::Result;
use crate::types::cseq::CSeq;
use crate::types::headers::Headers;
use crate::types::host::join_host_port;
use crate::types::message::write_message;
use crate::types::method::Method;
use crate::types::transport::TransportKind;
use crate::types::uri::Uri;
use crate::types::via::ViaHop;

/// A SIP request plus the transport metadata the stack attaches to it.
///
/// `source` and `destination` are `host:port` strings. For inbound requests
/// the transport fills both; for outbound requests they default to the top
/// Via sent-by and the Request-URI respectively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub version: String,
    pub headers: Headers,
    pub body: Bytes,
    transport: Option<TransportKind>,
    source: Option<String>,
    destination: Option<String>,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            version: "SIP/2.0".to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
            transport: None,
            source: None,
            destination: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Explicit transport, else the Request-URI `transport` param, else UDP
    pub fn transport(&self) -> TransportKind {
        self.transport
            .or_else(|| self.uri.params.get("transport").and_then(|t| t.parse().ok()))
            .unwrap_or(TransportKind::Udp)
    }

    pub fn set_transport(&mut self, transport: TransportKind) {
        self.transport = Some(transport);
    }

    pub fn source(&self) -> Option<String> {
        if let Some(source) = &self.source {
            return Some(source.clone());
        }
        let hop = self.via_hop().ok()?;
        let port = hop
            .port
            .unwrap_or_else(|| hop.transport.parse::<TransportKind>().map_or(5060, |t| t.default_port()));
        Some(join_host_port(&hop.host, Some(port)))
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = Some(source.into());
    }

    pub fn destination(&self) -> String {
        self.destination.clone().unwrap_or_else(|| self.uri.host_port())
    }

    pub fn set_destination(&mut self, destination: impl Into<String>) {
        self.destination = Some(destination.into());
    }

    pub fn via_hop(&self) -> Result<ViaHop> {
        self.headers.top_via()
    }

    pub fn set_via_hop(&mut self, hop: &ViaHop) {
        self.headers.set_top_via(hop);
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

    pub fn is_invite(&self) -> bool {
        self.method == Method::Invite
    }

    pub fn is_ack(&self) -> bool {
        self.method == Method::Ack
    }

    pub fn is_cancel(&self) -> bool {
        self.method == Method::Cancel
    }

    pub fn start_line(&self) -> String {
        format!("{} {} {}", self.method, self.uri, self.version)
    }

    /// Wire form; Content-Length always reflects the body
    pub fn to_bytes(&self) -> Bytes {
        write_message(&self.start_line(), &self.headers, &self.body)
    }

    /// One-line summary for logs
    pub fn short(&self) -> String {
        format!(
            "{} (cseq: {}, call-id: {})",
            self.start_line(),
            self.headers.get("CSeq").unwrap_or("-"),
            self.headers.get("Call-ID").unwrap_or("-")
        )
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_headers() {
        let req = Request::new(Method::Options, "sip:bob@biloxi.com:5080;transport=tcp".parse().unwrap())
            .with_header("Via", "SIP/2.0/TLS client.atlanta.com;branch=z9hG4bK74bf9");

        assert_eq!(req.transport(), TransportKind::Tcp);
        assert_eq!(req.destination(), "biloxi.com:5080");
        assert_eq!(req.source().as_deref(), Some("client.atlanta.com:5061"));

        let mut req = req;
        req.set_transport(TransportKind::Udp);
        req.set_source("10.0.0.1:5060");
        req.set_destination("10.0.0.2:5060");
        assert_eq!(req.transport(), TransportKind::Udp);
        assert_eq!(req.source().as_deref(), Some("10.0.0.1:5060"));
        assert_eq!(req.destination(), "10.0.0.2:5060");
    }

    #[test]
    fn test_to_bytes_sets_content_length() {
        let req = Request::new(Method::Message, "sip:bob@biloxi.com".parse().unwrap())
            .with_header("Content-Length", "999")
            .with_body("hello");
        let text = String::from_utf8(req.to_bytes().to_vec()).unwrap();
        assert!(text.starts_with("MESSAGE sip:bob@biloxi.com SIP/2.0\r\n"));
        assert!(text.ends_with("Content-Length: 5\r\n\r\nhello"));
        assert!(!text.contains("999"));
    }
}
