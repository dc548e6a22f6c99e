use thiserror::Error;

use spotgrid_state::{StateError, SyncState};

pub type ReplicaResult<T> = Result<T, ReplicaError>;

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("replica link not found: {0}")]
    NotFound(String),

    #[error("replica {link} is {state:?}, not ready")]
    NotReady { link: String, state: SyncState },

    #[error("invalid sync transition {from:?} -> {to:?}")]
    InvalidTransition { from: SyncState, to: SyncState },

    #[error("primary {0} already has a standby")]
    StandbyExists(String),

    #[error("replica {link} not healthy after {attempts} probes")]
    ProbeExhausted { link: String, attempts: u32 },

    #[error("replica backend error: {0}")]
    Backend(String),

    #[error("state error: {0}")]
    State(#[from] StateError),
}
