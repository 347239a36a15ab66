use thiserror::Error;

use crate::key::TransactionKey;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in SIP transaction handling
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Timer B/F fired for a client transaction or Timer H for a server
    /// transaction before the exchange completed.
    #[error("transaction {key} timed out")]
    Timeout { key: TransactionKey },

    /// The transport failed to send a message on behalf of a transaction.
    #[error("transaction {key} failed to send {message}: {reason}")]
    Transport {
        key: TransactionKey,
        message: String,
        reason: String,
    },

    /// The transaction was terminated before it produced a result.
    #[error("transaction {key} terminated")]
    Terminated { key: TransactionKey },

    /// A message of the wrong kind was delivered to a transaction.
    #[error("transaction {key} received unexpected {message}: {reason}")]
    UnexpectedMessage {
        key: TransactionKey,
        message: String,
        reason: String,
    },

    /// A transaction key could not be derived from a message.
    #[error("cannot build transaction key for '{message}': {reason}")]
    Key { message: String, reason: String },

    /// No transaction is stored under the key.
    #[error("transaction with key '{0}' not found")]
    NoTransaction(TransactionKey),

    /// A live transaction already holds the key.
    #[error("transaction with key '{0}' already exists")]
    DuplicateKey(TransactionKey),

    /// ACK never forms a client transaction of its own.
    #[error("ACK request must be sent directly through transport")]
    AckNotAllowed,

    /// The state machine has no transition for the input in its state.
    #[error("transaction {key}: no transition for {input} in state {state}")]
    InvalidTransition {
        key: TransactionKey,
        state: String,
        input: String,
    },

    /// The transaction layer has been canceled.
    #[error("transaction layer is canceled")]
    LayerCanceled,

    /// A request completed with a final non-2xx response.
    #[error("request failed with {status} {reason}")]
    RequestFailed { status: u16, reason: String },

    /// The transaction ended without a final response.
    #[error("request terminated (487)")]
    RequestTerminated,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Error::Terminated { .. } | Error::RequestTerminated)
    }

    /// Key of the transaction the error belongs to, if any
    pub fn key(&self) -> Option<&TransactionKey> {
        match self {
            Error::Timeout { key }
            | Error::Transport { key, .. }
            | Error::Terminated { key }
            | Error::UnexpectedMessage { key, .. }
            | Error::InvalidTransition { key, .. } => Some(key),
            Error::NoTransaction(key) | Error::DuplicateKey(key) => Some(key),
            _ => None,
        }
    }
}

impl From<sipflow_infra_common::Error> for Error {
    fn from(e: sipflow_infra_common::Error) -> Self {
        Error::Config(e.to_string())
    }
}
