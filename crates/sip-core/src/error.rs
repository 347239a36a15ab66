use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while parsing or inspecting SIP messages.
///
/// The transport layer relies on the split between syntax errors (garbage on
/// the wire, logged and dropped) and malformed/broken messages (surfaced to
/// the application), see [`Error::is_syntax`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The input is not a SIP message at all
    #[error("syntax error: {0}")]
    Syntax(String),

    /// The message parsed but violates a framing rule
    #[error("malformed message: {reason}")]
    Malformed {
        reason: String,
        /// Short summary of the offending message
        message: String,
    },

    /// The message body does not match its declared length
    #[error("broken message: {reason}")]
    Broken {
        reason: String,
        /// Short summary of the offending message
        message: String,
    },

    /// A header is present but its value cannot be interpreted
    #[error("invalid {header} header: {reason}")]
    InvalidHeader { header: String, reason: String },

    /// A required header is absent
    #[error("missing required '{0}' header")]
    MissingHeader(&'static str),

    /// A URI could not be parsed
    #[error("invalid URI '{0}'")]
    InvalidUri(String),

    /// A transport token is not one of UDP, TCP or TLS
    #[error("unsupported transport '{0}'")]
    UnsupportedTransport(String),
}

impl Error {
    /// Garbage input that should be dropped without closing the connection
    pub fn is_syntax(&self) -> bool {
        matches!(self, Error::Syntax(_) | Error::InvalidUri(_))
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::Malformed { .. })
    }

    pub fn is_broken(&self) -> bool {
        matches!(self, Error::Broken { .. })
    }

    pub(crate) fn invalid_header(header: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidHeader {
            header: header.into(),
            reason: reason.into(),
        }
    }
}
