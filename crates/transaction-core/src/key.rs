//! Transaction keys (RFC 3261 17.1.3 and 17.2.3).
//!
//! A client transaction is matched by the branch of the top Via plus the
//! CSeq method. A server transaction additionally includes the sent-by of
//! the top Via, and peers that do not use RFC 3261 branches are matched by
//! the RFC 2543 tuple of From tag, Call-ID, CSeq and top Via.
//!
//! ACK and CANCEL are folded onto INVITE so that they find the INVITE
//! transaction they belong to.

use std::fmt;

use sipflow_sip_core::{Message, Method, TransportKind, ViaHop, RFC3261_BRANCH_MAGIC_COOKIE};

use crate::error::{Error, Result};

const SEP: &str = "__";

/// Key under which a transaction is stored and matched
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionKey(String);

impl TransactionKey {
    /// Key of the client transaction `msg` belongs to.
    ///
    /// The top Via must carry an RFC 3261 branch.
    pub fn client(msg: &Message) -> Result<Self> {
        let method = key_method(msg)?;
        let hop = top_via(msg)?;
        let branch = rfc3261_branch(&hop)
            .ok_or_else(|| key_error(msg, "'branch' not found or empty in 'Via' header"))?;

        Ok(TransactionKey([branch, method.as_str()].join(SEP)))
    }

    /// Key of the server transaction `msg` belongs to.
    pub fn server(msg: &Message) -> Result<Self> {
        let hop = top_via(msg)?;
        let method = key_method(msg)?;

        if let Some(branch) = rfc3261_branch(&hop) {
            let port = hop.port.unwrap_or_else(|| {
                hop.transport
                    .parse::<TransportKind>()
                    .map_or(5060, |transport| transport.default_port())
            });
            return Ok(TransactionKey(
                [branch, hop.host.as_str(), &port.to_string(), method.as_str()].join(SEP),
            ));
        }

        // RFC 2543
        let from_tag = msg
            .from_tag()
            .ok_or_else(|| key_error(msg, "'tag' param not found in 'From' header"))?;
        let call_id = msg
            .call_id()
            .map_err(|_| key_error(msg, "'Call-ID' header not found"))?;
        let cseq = msg.cseq().map_err(|_| key_error(msg, "'CSeq' header not found"))?;

        Ok(TransactionKey(
            [
                from_tag.as_str(),
                call_id,
                method.as_str(),
                &cseq.seq.to_string(),
                &hop.to_string(),
            ]
            .join(SEP),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionKey {
    fn from(s: &str) -> Self {
        TransactionKey(s.to_string())
    }
}

impl From<String> for TransactionKey {
    fn from(s: String) -> Self {
        TransactionKey(s)
    }
}

fn key_error(msg: &Message, reason: &str) -> Error {
    Error::Key {
        message: msg.short(),
        reason: reason.to_string(),
    }
}

fn top_via(msg: &Message) -> Result<ViaHop> {
    msg.via_hop()
        .map_err(|_| key_error(msg, "'Via' header not found or empty"))
}

fn key_method(msg: &Message) -> Result<Method> {
    let cseq = msg.cseq().map_err(|_| key_error(msg, "'CSeq' header not found"))?;
    Ok(match cseq.method {
        Method::Ack | Method::Cancel => Method::Invite,
        method => method,
    })
}

fn rfc3261_branch(hop: &ViaHop) -> Option<&str> {
    hop.branch().filter(|branch| {
        branch.len() > RFC3261_BRANCH_MAGIC_COOKIE.len() && branch.starts_with(RFC3261_BRANCH_MAGIC_COOKIE)
    })
}
