//! Rollout error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RolloutError {
    /// The ramp was asked to run with no releases. Callers always create the
    /// candidate release first, so this is a bug rather than a runtime state.
    #[error("cannot deploy empty release set for {0}")]
    EmptyReleaseSet(String),

    #[error("build not found: {0}")]
    MissingBuild(String),

    #[error("state store error: {0}")]
    State(#[from] flotilla_state::StateError),

    #[error("autoscaler error: {0}")]
    Autoscale(#[from] flotilla_autoscale::AutoscaleError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl RolloutError {
    /// Everything except invariant violations is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RolloutError::EmptyReleaseSet(_))
    }
}

pub type RolloutResult<T> = Result<T, RolloutError>;
