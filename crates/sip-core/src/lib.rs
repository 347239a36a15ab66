//! # sipflow-sip-core
//!
//! The SIP message surface the transport and transaction layers are built
//! on. It is deliberately small: requests and responses keep their headers
//! as raw lines and expose typed accessors only for what the lower layers
//! need (top Via hop, CSeq, Call-ID, From tag, Content-Length).
//!
//! Two parsers are provided:
//!
//! - [`parse_message`] for datagram transports, where each packet is exactly
//!   one message
//! - [`StreamParser`] for stream transports, where messages are framed by
//!   Content-Length
//!
//! Parse failures are classified by [`Error::is_syntax`]: syntax errors are
//! noise to be dropped, everything else is worth reporting.

pub mod builder;
pub mod error;
pub mod parser;
pub mod types;

pub use builder::{generate_branch, generate_tag};
pub use error::{Error, Result};
pub use parser::{parse_message, StreamParser, MAX_BODY_SIZE};
pub use types::*;

pub mod prelude {
    pub use crate::builder::{generate_branch, generate_tag};
    pub use crate::error::{Error, Result};
    pub use crate::parser::{parse_message, StreamParser};
    pub use crate::types::status;
    pub use crate::types::{
        CSeq, Header, Headers, Message, Method, Params, Request, Response, TransportKind, Uri,
        ViaHop, RFC3261_BRANCH_MAGIC_COOKIE,
    };
}
