use thiserror::Error;

use spotgrid_state::StateError;

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("signing error: {0}")]
    Signature(#[from] SignatureError),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

/// Failures of the command channel itself.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to agent {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("agent channel I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent closed the channel")]
    Closed,

    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Signing and verification failures.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("command is not signed")]
    Unsigned,

    #[error("unknown signing key {0}")]
    UnknownKey(String),

    #[error("malformed signature: {0}")]
    Malformed(String),

    #[error("signature does not match command")]
    Invalid,

    #[error("command issued {age}s ago exceeds the allowed age")]
    Stale { age: u64 },

    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("key file: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode command: {0}")]
    Encode(#[from] serde_json::Error),
}
