//! flotilla-autoscale: horizontal autoscaling for settled releases.
//!
//! Two halves:
//!
//! - **`coordinator`** decides whether a descriptor gets an autoscaler at
//!   all, binds it to the active release, and tears it down while a
//!   promotion is in flight so the ramp owns instance counts.
//! - **`scaler`** plays the autoscaler itself: it samples instance CPU
//!   utilization and writes the replica count of the bound release.
//!
//! # Scaling Algorithm
//!
//! ```text
//! utilization = mean(cpu_utilization of running instances)
//! ratio       = utilization / target_cpu_utilization
//!
//! if |ratio - 1| <= 0.1:
//!     NoChange
//! desired = ceil(current_replicas * ratio), clamped to [min, max]
//! ```
//!
//! Scale-down additionally waits out a stabilization window so a brief dip
//! does not shed capacity.

pub mod coordinator;
pub mod error;
pub mod scaler;

pub use coordinator::{AutoscalerCoordinator, scaler_name};
pub use error::{AutoscaleError, AutoscaleResult};
pub use scaler::{HorizontalScaler, ScaleDecision};
