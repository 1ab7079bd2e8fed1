use thiserror::Error;

/// Result type for stage-local operations.
pub type StageResult<T> = Result<T, StageError>;

/// Failures raised by individual pipeline stages.
///
/// Format, region and single-frame model failures are absorbed by the
/// pipeline (the frame is skipped and tracked state ages). Only
/// `DimensionMismatch` is surfaced to callers, since it signals a contract
/// violation on their side.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageError {
    #[error("malformed pixel layout: {0}")]
    Format(String),

    #[error("invalid region: {0}")]
    InvalidRegion(String),

    #[error("detector unavailable: {0}")]
    DetectorUnavailable(String),

    #[error("scorer unavailable: {0}")]
    ScorerUnavailable(String),

    #[error("dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

impl StageError {
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn region(msg: impl Into<String>) -> Self {
        Self::InvalidRegion(msg.into())
    }
}
