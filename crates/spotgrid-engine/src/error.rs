use thiserror::Error;

use spotgrid_core::TelemetryError;
use spotgrid_state::StateError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed telemetry: {0}")]
    InvalidTelemetry(#[from] TelemetryError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("evaluation task failed: {0}")]
    Join(String),
}
