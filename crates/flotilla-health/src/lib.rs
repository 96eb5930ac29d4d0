//! flotilla-health: release translation and health reporting.
//!
//! The [`ReleaseReconciler`] turns each release into a replica group and
//! folds what the runtime reports back into the release status.
//!
//! # Architecture
//!
//! ```text
//! ReleaseReconciler
//!   ├── translator: release + build + config map + dependencies → ReplicaGroup
//!   │     (skipped while an autoscaler owns the active release's count)
//!   ├── status: role + observed counts → lifecycle state
//!   └── status: instances → pod errors, stuck detection → failed
//! ```

pub mod controller;
pub mod error;
pub mod status;
pub mod translator;

pub use controller::ReleaseReconciler;
pub use error::{HealthError, HealthResult};
pub use status::{Diagnosis, ObservedCounts, diagnose, next_status, pod_error, release_state};
pub use translator::{dependency_env, replica_group_for, service_hostname};
