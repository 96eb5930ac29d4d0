//! flotilla-rollout: release selection and progressive traffic shifting.
//!
//! The [`DeploymentReconciler`] owns everything derived from one
//! deployment descriptor except the running instances themselves:
//!
//! - **`config`** merges app and shared configuration and materializes it
//!   as a content-addressed config map.
//! - **`naming`** fingerprints a descriptor and names releases so that
//!   unchanged inputs always map to the same release.
//! - **`ramp`** picks the active and target releases and moves instances
//!   and traffic from one to the other in bounded steps.
//! - **`retention`** expires old releases.
//! - **`routing`** publishes the weighted release list for the mesh.
//!
//! # Ramp
//!
//! ```text
//! step        = max(1, desired * 25%)
//! instances   = min(desired, available + step)
//! traffic     = clamp(available / desired * 100, last, last + 25)
//! traffic 100 → promote target to active
//! ```
//!
//! Each step waits one readiness timeout after the previous one.

pub mod config;
pub mod controller;
pub mod error;
pub mod naming;
pub mod ramp;
pub mod retention;
pub mod routing;

pub use config::{ConfigSource, ResolvedConfig, StoreConfigSource};
pub use controller::{DeploymentReconciler, release_for_target};
pub use error::{RolloutError, RolloutResult};
pub use naming::{release_name, sort_newest_first, target_fingerprint};
pub use ramp::{RampOutcome, deploy_releases, first_deployable};
pub use retention::collect_garbage;
pub use routing::traffic_split_for;
