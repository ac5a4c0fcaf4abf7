//! Generic error type for the ambient stack (config loading, logging
//! setup). Component-level failures use `protocol::Kind`/`VhciError`
//! instead; this type exists for the plumbing around them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
