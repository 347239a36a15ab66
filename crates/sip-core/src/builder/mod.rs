//! Builders for the requests the transaction layer synthesizes itself:
//! ACK for a non-2xx final response and CANCEL for a pending INVITE, plus
//! branch and tag generation.

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{Error, Result};
use crate::types::{CSeq, Method, Request, Response, RFC3261_BRANCH_MAGIC_COOKIE};

/// Fresh RFC 3261 branch: magic cookie plus a random token
pub fn generate_branch() -> String {
    format!("{}{}", RFC3261_BRANCH_MAGIC_COOKIE, random_token(16))
}

/// Fresh From/To tag
pub fn generate_tag() -> String {
    random_token(10)
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

impl Request {
    /// ACK for a non-2xx final response (RFC 3261 17.1.1.3).
    ///
    /// Same Request-URI, Call-ID, From and CSeq number as the INVITE, a
    /// single Via equal to the INVITE's top Via, the To header of the
    /// response and the INVITE's Route set.
    pub fn ack_for(invite: &Request, response: &Response) -> Result<Request> {
        let mut ack = derived_request(invite, Method::Ack)?;
        let to = response
            .headers
            .get("To")
            .or_else(|| invite.headers.get("To"))
            .ok_or(Error::MissingHeader("To"))?;
        ack.headers.set("To", to);
        Ok(ack)
    }

    /// CANCEL for a pending request (RFC 3261 9.1).
    pub fn cancel_for(invite: &Request) -> Result<Request> {
        let mut cancel = derived_request(invite, Method::Cancel)?;
        let to = invite.headers.get("To").ok_or(Error::MissingHeader("To"))?;
        cancel.headers.set("To", to);
        Ok(cancel)
    }
}

fn derived_request(origin: &Request, method: Method) -> Result<Request> {
    let top = origin.via_hop()?;
    let cseq = origin.cseq()?;

    let mut req = Request::new(method.clone(), origin.uri.clone());
    req.headers.push("Via", top.to_string());
    for route in origin.headers.get_all("Route") {
        req.headers.push("Route", route);
    }
    req.headers.push("Max-Forwards", "70");
    if let Some(from) = origin.headers.get("From") {
        req.headers.push("From", from);
    }
    req.headers.push("To", "");
    req.headers.push("Call-ID", origin.call_id()?);
    req.headers.push("CSeq", CSeq::new(cseq.seq, method).to_string());

    req.set_transport(origin.transport());
    req.set_destination(origin.destination());
    if let Some(source) = origin.source() {
        req.set_source(source);
    }
    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransportKind;

    fn invite() -> Request {
        Request::new(Method::Invite, "sip:bob@biloxi.com".parse().unwrap())
            .with_transport(TransportKind::Udp)
            .with_header("Via", "SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKnashds8, SIP/2.0/UDP proxy.atlanta.com;branch=z9hG4bK1")
            .with_header("Route", "<sip:proxy.biloxi.com;lr>")
            .with_header("To", "Bob <sip:bob@biloxi.com>")
            .with_header("From", "Alice <sip:alice@atlanta.com>;tag=1928301774")
            .with_header("Call-ID", "a84b4c76e66710")
            .with_header("CSeq", "314159 INVITE")
            .with_header("Contact", "<sip:alice@pc33.atlanta.com>")
            .with_body("v=0\r\n")
    }

    #[test]
    fn test_generate_branch() {
        let a = generate_branch();
        let b = generate_branch();
        assert!(a.starts_with(RFC3261_BRANCH_MAGIC_COOKIE));
        assert_eq!(a.len(), RFC3261_BRANCH_MAGIC_COOKIE.len() + 16);
        assert_ne!(a, b);
        assert_eq!(generate_tag().len(), 10);
    }

    #[test]
    fn test_ack_for_non_2xx() {
        let invite = invite();
        let mut res = Response::from_request(&invite, 486, None);
        res.headers.set("To", "Bob <sip:bob@biloxi.com>;tag=a6c85cf");

        let ack = Request::ack_for(&invite, &res).unwrap();
        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.uri, invite.uri);
        assert_eq!(ack.via_hop().unwrap(), invite.via_hop().unwrap());
        assert_eq!(ack.headers.via_hops().unwrap().len(), 1);
        assert_eq!(ack.cseq().unwrap(), CSeq::new(314159, Method::Ack));
        assert_eq!(ack.headers.to_tag().as_deref(), Some("a6c85cf"));
        assert_eq!(ack.headers.get("Route"), Some("<sip:proxy.biloxi.com;lr>"));
        assert!(!ack.headers.contains("Contact"));
        assert!(ack.body.is_empty());
        assert_eq!(ack.destination(), invite.destination());
    }

    #[test]
    fn test_cancel_for_invite() {
        let invite = invite();
        let cancel = Request::cancel_for(&invite).unwrap();
        assert_eq!(cancel.method, Method::Cancel);
        assert_eq!(cancel.via_hop().unwrap().branch(), Some("z9hG4bKnashds8"));
        assert_eq!(cancel.cseq().unwrap(), CSeq::new(314159, Method::Cancel));
        assert_eq!(cancel.headers.get("To"), Some("Bob <sip:bob@biloxi.com>"));
        assert_eq!(cancel.call_id().unwrap(), "a84b4c76e66710");
    }

    #[test]
    fn test_cancel_requires_via() {
        let req = Request::new(Method::Invite, "sip:bob@biloxi.com".parse().unwrap());
        assert_eq!(Request::cancel_for(&req).unwrap_err(), Error::MissingHeader("Via"));
    }
}
