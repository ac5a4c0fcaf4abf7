//! Typed errors for the wire codec and the shared data model.

use thiserror::Error;

use crate::kind::Kind;

/// An error produced by the protocol crate, always carrying a stable [`Kind`]
/// so callers can classify it without matching on the message.
#[derive(Debug, Error)]
pub enum VhciError {
    #[error("{kind}: {message}")]
    Protocol { kind: Kind, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VhciError {
    pub fn new(kind: Kind, message: impl Into<String>) -> Self {
        VhciError::Protocol {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(Kind::InvalidParameter, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(Kind::Protocol, message)
    }

    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Self::new(
            Kind::BufferTooSmall,
            format!("needed {needed}, available {available}"),
        )
    }

    /// The stable classification of this error, for callers that branch on
    /// retryability or ABI-fatality rather than on the message text.
    pub fn kind(&self) -> Kind {
        match self {
            VhciError::Protocol { kind, .. } => *kind,
            VhciError::Io(_) => Kind::Network,
        }
    }
}

pub type Result<T> = std::result::Result<T, VhciError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrips_through_display() {
        let err = VhciError::invalid_parameter("direction mismatch");
        assert_eq!(err.kind(), Kind::InvalidParameter);
        assert!(err.to_string().contains("INVALID_PARAMETER"));
        assert!(err.to_string().contains("direction mismatch"));
    }

    #[test]
    fn io_errors_classify_as_network() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: VhciError = io.into();
        assert_eq!(err.kind(), Kind::Network);
    }
}
