use thiserror::Error;

pub type PredictorResult<T> = Result<T, PredictorError>;

#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("predictor not configured")]
    Unavailable,

    #[error("predictor request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("predictor returned status {0}")]
    Status(u16),

    #[error("invalid predictor response: {0}")]
    InvalidResponse(String),
}
