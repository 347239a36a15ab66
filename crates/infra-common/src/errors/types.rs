use thiserror::Error;

/// Result type for infrastructure operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the infrastructure helpers
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be parsed or was invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// A configuration file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The global tracing subscriber could not be installed
    #[error("logging setup failed: {0}")]
    Logging(String),
}
