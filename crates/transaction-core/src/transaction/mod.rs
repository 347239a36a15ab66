//! Client and server transactions.
//!
//! Both kinds share the same shape: an immutable part (key, origin request,
//! transport) behind an `Arc`, and a mutable core behind a per-transaction
//! async mutex. Every input (inbound message, application call or timer)
//! takes that mutex and runs the state machine to completion, so the inputs
//! of one transaction never interleave.
//!
//! Results flow to the application through unbounded queues owned by the
//! transaction. Deleting a transaction drops their senders, which closes
//! every queue exactly once, stops all timers and resolves [`done`].
//!
//! [`done`]: Transaction::done

pub mod client;
pub mod server;

use sipflow_sip_core::Message;

pub use client::ClientTransaction;
pub use server::ServerTransaction;

use crate::error::{Error, Result};
use crate::key::TransactionKey;

/// A stored transaction of either kind
#[derive(Clone, Debug)]
pub enum Transaction {
    Client(ClientTransaction),
    Server(ServerTransaction),
}

impl Transaction {
    pub fn key(&self) -> &TransactionKey {
        match self {
            Transaction::Client(tx) => tx.key(),
            Transaction::Server(tx) => tx.key(),
        }
    }

    /// Feed an inbound message to the transaction
    pub async fn receive(&self, msg: Message) -> Result<()> {
        match self {
            Transaction::Client(tx) => tx.receive(msg).await,
            Transaction::Server(tx) => tx.receive(msg).await,
        }
    }

    /// Delete the transaction regardless of its state
    pub async fn terminate(&self) {
        match self {
            Transaction::Client(tx) => tx.terminate().await,
            Transaction::Server(tx) => tx.terminate().await,
        }
    }

    /// Resolves once the transaction is deleted
    pub async fn done(&self) {
        match self {
            Transaction::Client(tx) => tx.done().await,
            Transaction::Server(tx) => tx.done().await,
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            Transaction::Client(tx) => tx.is_done(),
            Transaction::Server(tx) => tx.is_done(),
        }
    }

    /// Whether both handles refer to the same transaction
    pub(crate) fn same(&self, other: &Transaction) -> bool {
        match (self, other) {
            (Transaction::Client(a), Transaction::Client(b)) => a.same(b),
            (Transaction::Server(a), Transaction::Server(b)) => a.same(b),
            _ => false,
        }
    }
}

pub(crate) fn transport_error(
    key: &TransactionKey,
    message: &Message,
    err: &sipflow_sip_transport::Error,
) -> Error {
    Error::Transport {
        key: key.clone(),
        message: message.short(),
        reason: err.to_string(),
    }
}
