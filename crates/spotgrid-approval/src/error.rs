use thiserror::Error;

use spotgrid_state::StateError;

pub type ApprovalResult<T> = Result<T, ApprovalError>;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval request not found: {0}")]
    NotFound(String),

    #[error("state error: {0}")]
    State(#[from] StateError),
}
