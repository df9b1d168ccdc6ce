use thiserror::Error;

/// Top-level error type surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed or out-of-range input.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Worker id was never registered.
    #[error("worker not found: {0}")]
    NotFound(String),

    /// Worker exists but is not in the active state.
    #[error("worker inactive: {0}")]
    Inactive(String),

    /// Placement would push a worker past its capacity.
    #[error("no capacity: {0}")]
    NoCapacity(String),

    /// The stream already has an active assignment elsewhere.
    #[error("stream already assigned: {0}")]
    AlreadyAssigned(String),

    /// Persistence failed transiently after the retry budget was exhausted.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Bug or unexpected state.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Stable machine-readable kind, used in wire error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid",
            Self::NotFound(_) => "not_found",
            Self::Inactive(_) => "inactive",
            Self::NoCapacity(_) => "no_capacity",
            Self::AlreadyAssigned(_) => "already_assigned",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the caller may retry the same request and expect success.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
