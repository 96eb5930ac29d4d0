//! Autoscaling error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutoscaleError {
    #[error("state store error: {0}")]
    State(#[from] flotilla_state::StateError),
}

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;
