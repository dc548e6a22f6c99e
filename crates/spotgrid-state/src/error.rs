//! Failures surfaced by the SpotGrid ledger store.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// Store failures. redb and serde errors are carried as their messages.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open ledger database: {0}")]
    Open(String),

    #[error("ledger transaction aborted: {0}")]
    Transaction(String),

    #[error("ledger table unavailable: {0}")]
    Table(String),

    #[error("ledger lookup failed: {0}")]
    Read(String),

    #[error("ledger insert failed: {0}")]
    Write(String),

    #[error("record could not be encoded: {0}")]
    Serialize(String),

    #[error("stored record is unreadable: {0}")]
    Deserialize(String),

    /// Insert-only tables refuse to overwrite an existing key.
    #[error("key {0} is already taken")]
    Conflict(String),

    /// JSON-lines export sink rejected a write.
    #[error("event export failed: {0}")]
    Export(#[from] std::io::Error),
}

impl StateError {
    /// True for failures a caller can resolve by retrying with a new key.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict(_))
    }
}
