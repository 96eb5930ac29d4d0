//! Release lifecycle state and per-instance diagnostics.
//!
//! ```text
//! role     counts                         state
//! active   desired == 0                   halted
//! active   available >= desired > 0       released
//! active   otherwise                      releasing
//! target   -                              releasing
//! bad      -                              bad
//! none     spec desired == 0              retired
//! none     otherwise                      retiring
//! ```
//!
//! Overriding all of that, a release whose instances never ran and whose
//! oldest instance is older than the readiness timeout is `failed`.

use std::time::Duration;

use flotilla_state::*;

/// Generic termination reason; a more specific one is preferred.
const GENERIC_TERMINATION_REASON: &str = "Error";
const UNSCHEDULABLE_REASON: &str = "Unschedulable";

/// Observed instance counts of a release's replica group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObservedCounts {
    pub desired: u32,
    pub ready: u32,
    pub available: u32,
}

impl ObservedCounts {
    /// Counts from the live replica group; all zero when there is none.
    pub fn from_group(group: Option<&ReplicaGroup>) -> Self {
        group
            .map(|g| Self {
                desired: g.spec.replicas,
                ready: g.status.ready_replicas,
                available: g.status.available_replicas,
            })
            .unwrap_or_default()
    }
}

/// State implied by the release's role and observed counts.
pub fn release_state(spec: &AppReleaseSpec, counts: ObservedCounts) -> ReleaseState {
    match spec.role {
        ReleaseRole::Active if counts.desired == 0 => ReleaseState::Halted,
        ReleaseRole::Active if counts.available >= counts.desired => ReleaseState::Released,
        ReleaseRole::Active => ReleaseState::Releasing,
        ReleaseRole::Target => ReleaseState::Releasing,
        ReleaseRole::Bad => ReleaseState::Bad,
        ReleaseRole::None if spec.num_desired == 0 => ReleaseState::Retired,
        ReleaseRole::None => ReleaseState::Retiring,
    }
}

/// The most useful explanation for an unhealthy instance, if any.
pub fn pod_error(instance: &Instance) -> Option<PodError> {
    let error = |reason: &str, message: &str| PodError {
        pod: instance.name().to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
    };

    if let Some(cond) = instance
        .status
        .conditions
        .iter()
        .find(|c| c.reason == UNSCHEDULABLE_REASON)
    {
        return Some(error(&cond.reason, &cond.message));
    }

    let mut generic = None;
    for status in &instance.status.container_statuses {
        if let Some(terminated) = &status.last_termination {
            if terminated.reason != GENERIC_TERMINATION_REASON {
                return Some(error(&terminated.reason, &terminated.message));
            }
            generic = Some(error(&terminated.reason, &terminated.message));
        }
    }

    let waiting = instance
        .status
        .container_statuses
        .iter()
        .find_map(|s| match &s.state {
            ContainerState::Waiting { reason, message } => Some(error(reason, message)),
            _ => None,
        });
    waiting.or(generic)
}

/// Diagnostics gathered from a release's instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnosis {
    pub pod_errors: Vec<PodError>,
    /// No instance ever ran and the oldest has outlived the readiness
    /// timeout.
    pub stuck: bool,
}

pub fn diagnose(instances: &[Instance], timeout: Duration, now: u64) -> Diagnosis {
    let pod_errors = instances.iter().filter_map(pod_error).collect();
    let any_ran = instances.iter().any(|i| {
        matches!(
            i.status.phase,
            InstancePhase::Running | InstancePhase::Succeeded
        )
    });
    let oldest = instances.iter().map(|i| i.meta.created_at).min();
    let stuck = !any_ran
        && oldest.is_some_and(|created| now.saturating_sub(created) > timeout.as_secs());
    Diagnosis { pod_errors, stuck }
}

/// Next status for `release`. `diagnosis` is present when the release is
/// short of available instances.
pub fn next_status(
    release: &AppRelease,
    counts: ObservedCounts,
    diagnosis: Option<Diagnosis>,
    now: u64,
) -> AppReleaseStatus {
    let previous = &release.status;
    let mut state = release_state(&release.spec, counts);

    let mut pod_errors = Vec::new();
    if let Some(diagnosis) = diagnosis {
        pod_errors = diagnosis.pod_errors;
        if diagnosis.stuck && release.spec.role != ReleaseRole::Bad {
            state = ReleaseState::Failed;
        }
    }
    // A failed release stays failed until something gives it a role again.
    if previous.state == ReleaseState::Failed && release.spec.role == ReleaseRole::None {
        state = ReleaseState::Failed;
    }

    let state_changed_at = if state == previous.state && previous.state_changed_at != 0 {
        previous.state_changed_at
    } else {
        now
    };

    AppReleaseStatus {
        state,
        state_changed_at,
        num_desired: counts.desired,
        num_ready: counts.ready,
        num_available: counts.available,
        pod_errors,
    }
}
