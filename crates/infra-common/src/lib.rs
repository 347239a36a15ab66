//! Common infrastructure shared by the sipflow crates.
//!
//! Nothing in here knows about SIP. The crate provides:
//!
//! - [`logging`]: `tracing-subscriber` bootstrap driven by [`logging::LoggingConfig`]
//! - [`config`]: TOML loading and serde helpers for millisecond durations
//! - [`task`]: panic-guarded task execution so a faulting callback is logged
//!   instead of tearing down its owner
//! - [`errors`]: the error type for the above

pub mod config;
pub mod errors;
pub mod logging;
pub mod task;

pub use errors::types::{Error, Result};
pub use logging::setup::{setup_logging, LoggingConfig};

pub mod prelude {
    pub use crate::config::{from_toml_str, load_toml};
    pub use crate::errors::types::{Error, Result};
    pub use crate::logging::setup::{setup_logging, LoggingConfig};
    pub use crate::task::{run_guarded, spawn_guarded};
}
