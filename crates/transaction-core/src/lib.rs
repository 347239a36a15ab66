//! SIP transaction layer for the sipflow stack
//!
//! This crate implements the RFC 3261 transaction state machines on top of
//! [`sipflow_sip_transport`]:
//!
//! - [`ClientTransaction`] sends a request, retransmits it over unreliable
//!   transports, acknowledges non-2xx final responses to INVITE and passes
//!   responses up
//! - [`ServerTransaction`] absorbs request retransmissions, retransmits
//!   final responses and sends an automatic `100 Trying` for INVITE
//! - [`TransactionLayer`] matches inbound messages to transactions by
//!   [`TransactionKey`] and exposes the request, ACK, response and error
//!   queues to the application
//! - [`request_with_cancellation`] and [`RequestDispatcher`] are small
//!   conveniences for user agents built on the layer
//!
//! Timer values come from [`TimerSettings`] and default to the RFC 3261
//! constants (T1 = 500ms, T2 = 4s, T4 = 5s).

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fsm;
pub mod key;
pub mod layer;
pub mod request;
pub mod testing;
pub mod timer;
pub mod transaction;
pub mod transport;

pub use config::{StackConfig, TimerSettings, TransactionConfig};
pub use dispatcher::{RequestDispatcher, RequestHandler};
pub use error::{Error, Result};
pub use fsm::TransactionState;
pub use key::TransactionKey;
pub use layer::TransactionLayer;
pub use request::request_with_cancellation;
pub use timer::TimerType;
pub use transaction::{ClientTransaction, ServerTransaction, Transaction};
pub use transport::TxTransport;

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        request_with_cancellation, ClientTransaction, Error, RequestDispatcher, Result,
        ServerTransaction, TimerSettings, Transaction, TransactionConfig, TransactionKey,
        TransactionLayer, TransactionState,
    };
    pub use sipflow_sip_core::{Message, Method, Request, Response};
}
