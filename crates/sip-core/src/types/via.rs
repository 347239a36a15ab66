//! # Via hop
//!
//! One entry of the Via header chain (RFC 3261 section 20.42):
//!
//! ```text
//! Via: SIP/2.0/UDP pc33.atlanta.com:5060;branch=z9hG4bK776asdhds;rport
//! ```
//!
//! The transaction layer keys transactions off the top hop's `branch`, and
//! the transport layer rewrites the top hop's sent-by on the way out and
//! stamps `received`/`rport` on the way in.

use std::fmt;
use std::str::FromStr;

use nom::{
    bytes::complete::take_while1,
    character::complete::{char, space0, space1},
    sequence::{delimited, terminated, tuple},
    IResult,
};

use crate::error::{Error, Result};
use crate::types::host::{join_host_port, split_host_port};
use crate::types::param::Params;

/// Branch prefix marking an RFC 3261 compliant transaction id
pub const RFC3261_BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHop {
    pub protocol_name: String,
    pub protocol_version: String,
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl ViaHop {
    pub fn new(transport: &str, host: &str, port: Option<u16>) -> Self {
        ViaHop {
            protocol_name: "SIP".to_string(),
            protocol_version: "2.0".to_string(),
            transport: transport.to_string(),
            host: host.to_string(),
            port,
            params: Params::new(),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.params.set("branch", Some(branch.into()));
        self
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.get("branch")
    }

    /// True when the branch carries the RFC 3261 magic cookie
    pub fn has_rfc3261_branch(&self) -> bool {
        self.branch()
            .map_or(false, |b| b.starts_with(RFC3261_BRANCH_MAGIC_COOKIE))
    }

    pub fn received(&self) -> Option<&str> {
        self.params.get("received")
    }

    /// `host[:port]` exactly as advertised
    pub fn sent_by(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c))(input)
}

fn slash(input: &str) -> IResult<&str, char> {
    delimited(space0, char('/'), space0)(input)
}

// sent-protocol = protocol-name SLASH protocol-version SLASH transport
fn sent_protocol(input: &str) -> IResult<&str, (&str, &str, &str)> {
    terminated(
        tuple((terminated(token, slash), terminated(token, slash), token)),
        space1,
    )(input)
}

impl FromStr for ViaHop {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (rest, (name, version, transport)) = sent_protocol(s.trim())
            .map_err(|_| Error::invalid_header("Via", format!("bad sent-protocol in '{}'", s)))?;

        let (sent_by, params) = match rest.split_once(';') {
            Some((sent_by, params)) => (sent_by, Params::parse(params)),
            None => (rest, Params::new()),
        };
        let (host, port) =
            split_host_port(sent_by).map_err(|e| Error::invalid_header("Via", e.to_string()))?;

        Ok(ViaHop {
            protocol_name: name.to_string(),
            protocol_version: version.to_string(),
            transport: transport.to_ascii_uppercase(),
            host,
            port,
            params,
        })
    }
}

impl fmt::Display for ViaHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} {}{}",
            self.protocol_name,
            self.protocol_version,
            self.transport,
            self.sent_by(),
            self.params
        )
    }
}
