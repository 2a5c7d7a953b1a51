use uuid::Uuid;

/// Failures surfaced to callers of the simulation runtime.
///
/// Upstream LLM failures never appear here: they are absorbed where they
/// happen and replaced by a safe default.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("run {0} does not belong to the requesting student")]
    Unauthorized(Uuid),
    #[error("run {0} was modified concurrently")]
    Conflict(Uuid),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type SimulationResult<T> = Result<T, SimulationError>;
