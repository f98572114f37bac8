//! Failure taxonomy for request/response traffic.

use std::time::Duration;

use canopy_core::wire::{MessageType, WireError};
use canopy_core::Hash;

/// A reply that answered the right request with the wrong content.
///
/// Never retried: the same peer will keep sending the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityViolation {
    #[error("reply echoes {} but {} was requested", hex::encode(echoed), hex::encode(requested))]
    EchoMismatch { requested: Hash, echoed: Hash },

    #[error("reply content hashes to {} but {} was requested", hex::encode(computed), hex::encode(requested))]
    DigestMismatch { requested: Hash, computed: Hash },
}

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// Every attempt of a handshake-class request went unanswered.
    #[error("no reply after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    /// A datum request ran past its overall deadline.
    #[error("no datum within {0:?}")]
    DeadlineExceeded(Duration),

    #[error("integrity violation: {0}")]
    Integrity(#[from] IntegrityViolation),

    /// A reply carried our id but the wrong type.
    #[error("expected {expected:?}, got {got:?}")]
    Protocol {
        expected: MessageType,
        got: MessageType,
    },

    #[error("malformed frame: {0}")]
    Malformed(#[from] WireError),

    /// The peer answered with ErrorReply.
    #[error("peer reported: {0}")]
    Remote(String),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket pump stopped.
    #[error("link closed")]
    Closed,
}

impl ExchangeError {
    /// Whether sending the request again could help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout { .. }
                | ExchangeError::DeadlineExceeded(_)
                | ExchangeError::Protocol { .. }
                | ExchangeError::Io(_)
        )
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, ExchangeError::Integrity(_))
    }
}
