//! SIP message types consumed by the transport and transaction layers.

pub mod cseq;
pub mod headers;
pub mod host;
pub mod message;
pub mod method;
pub mod param;
pub mod sip_request;
pub mod sip_response;
pub mod status;
pub mod transport;
pub mod uri;
pub mod via;

pub use cseq::CSeq;
pub use headers::{Header, Headers};
pub use host::{host_ip, join_host_port, split_host_port};
pub use message::Message;
pub use method::Method;
pub use param::Params;
pub use sip_request::Request;
pub use sip_response::Response;
pub use transport::TransportKind;
pub use uri::Uri;
pub use via::{ViaHop, RFC3261_BRANCH_MAGIC_COOKIE};
