//! Release health error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("build not found: {0}")]
    MissingBuild(String),

    /// A declared dependency has no descriptor yet. Usually resolves once
    /// the other app is deployed.
    #[error("dependency {app} not found in target {target}")]
    MissingDependency { app: String, target: String },

    #[error("state store error: {0}")]
    State(#[from] flotilla_state::StateError),
}

pub type HealthResult<T> = Result<T, HealthError>;
