use thiserror::Error;

use crate::frame::SeqNo;

/// All errors produced by a relink connection.
#[derive(Debug, Error)]
pub enum RelinkError {
    /// The connection ended without a more specific cause: the abort signal
    /// fired, or the read side was shut down abruptly.
    #[error("connection aborted")]
    ConnectionAborted,

    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    #[error("message too short: expected at least {expected} bytes, got {actual}")]
    TruncatedMessage { expected: usize, actual: usize },

    #[error("unknown message kind: 0x{0:02x}")]
    UnknownMessageKind(u8),

    #[error("malformed message: {0}")]
    Decode(String),

    #[error("peer misbehaved: nackd {nackd} outside [{lower}, {upper}]")]
    PeerMisbehaved {
        nackd: SeqNo,
        lower: SeqNo,
        upper: SeqNo,
    },

    #[error("buffer is closed for writes")]
    BufferClosed,

    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl RelinkError {
    /// True for errors raised while decoding a received frame.
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            RelinkError::TruncatedMessage { .. }
                | RelinkError::UnknownMessageKind(_)
                | RelinkError::Decode(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RelinkError>;
