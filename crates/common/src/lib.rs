//! Ambient stack shared by the `vhci` library and the `cli` binary: a
//! generic error type for configuration/IO plumbing and the
//! `tracing-subscriber` setup used by every entry point.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::setup_logging;
