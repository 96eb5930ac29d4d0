//! Release selection and traffic ramp.
//!
//! Given every release of one descriptor, decide which release is active,
//! which one is being promoted, how many instances each should run and how
//! traffic is split between them. The function is pure: it edits the
//! in-memory records and the descriptor status and leaves persistence to
//! the caller.
//!
//! ```text
//!            ┌──────────── cooldown: one readiness timeout between steps ─────────┐
//!  new ──► target ──► +25% instances (gated on availability) ──► traffic ≤ +25% ──┤
//!                                                                                │
//!            active ◄──────────────── traffic reaches 100% ◄─────────────────────┘
//! ```

use std::time::Duration;

use tracing::{debug, info, warn};

use flotilla_state::labels::PROMOTION_TARGET_LABEL;
use flotilla_state::*;

use crate::error::{RolloutError, RolloutResult};
use crate::naming::newest_first;

/// Share of the desired instance count (and of traffic) added per step.
pub const RAMP_INCREMENT_PERCENT: u32 = 25;

/// Result of one ramp pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RampOutcome {
    /// Evaluate again after this long; `None` when the rollout is settled.
    pub requeue_after: Option<Duration>,
    /// Roles, instance counts or traffic moved on this pass.
    pub changed: bool,
}

/// Newest release that may receive traffic: never `bad`, and not `failed`
/// unless it is the release already serving as active.
pub fn first_deployable(releases: &[AppRelease]) -> Option<usize> {
    releases
        .iter()
        .enumerate()
        .filter(|(_, r)| r.spec.role != ReleaseRole::Bad)
        .filter(|(_, r)| {
            r.status.state != ReleaseState::Failed || r.spec.role == ReleaseRole::Active
        })
        .min_by(|(_, a), (_, b)| newest_first(a, b))
        .map(|(i, _)| i)
}

/// Run one pass of the selection and ramp algorithm at time `now`
/// (unix seconds).
pub fn deploy_releases(
    at: &mut AppTarget,
    releases: &mut [AppRelease],
    now: u64,
) -> RolloutResult<RampOutcome> {
    if releases.is_empty() {
        return Err(RolloutError::EmptyReleaseSet(at.key()));
    }
    let app_target = at.key();
    let timeout = at.readiness_timeout();
    let timeout_secs = timeout.as_secs();

    let current_active = releases
        .iter()
        .position(|r| r.spec.role == ReleaseRole::Active);
    let current_target = releases
        .iter()
        .position(|r| r.spec.role == ReleaseRole::Target)
        .or(current_active);

    // Mid-promotion: hold still until the last step has had time to settle.
    if let (Some(a), Some(t)) = (current_active, current_target)
        && a != t
    {
        let elapsed = now.saturating_sub(at.status.deploy_updated_at);
        if elapsed < timeout_secs {
            let remaining = Duration::from_secs(timeout_secs - elapsed);
            debug!(%app_target, remaining_secs = remaining.as_secs(), "waiting for next ramp step");
            return Ok(RampOutcome {
                requeue_after: Some(remaining),
                changed: false,
            });
        }
    }

    let Some(candidate) = first_deployable(releases) else {
        warn!(%app_target, "no deployable release");
        return Ok(RampOutcome::default());
    };

    let mut changed = false;
    let (mut active, target) = match current_active {
        None => {
            info!(%app_target, release = %releases[candidate].name(), "deploying initial release");
            changed = true;
            (candidate, candidate)
        }
        Some(active) => {
            if current_target != Some(candidate) {
                info!(
                    %app_target,
                    target = %releases[candidate].name(),
                    previous_target = current_target.map(|t| releases[t].name()).unwrap_or_default(),
                    "setting new target release"
                );
                changed = true;
            }
            (active, candidate)
        }
    };

    let desired = at.desired_instances();
    let increment = if at.needs_service() {
        RAMP_INCREMENT_PERCENT
    } else {
        // Nothing routes to it, so there is nothing to shift gradually.
        100
    };
    let mut requeue_after = None;

    let target_traffic = {
        let tr = &mut releases[target];
        let prev_traffic = tr.spec.traffic_percentage;
        if desired == 0 {
            if tr.spec.num_desired != 0 {
                info!(%app_target, release = %tr.name(), "scaling target to 0 instances");
                changed = true;
            }
            tr.spec.num_desired = 0;
            active = target;
            // Routing stays valid only if someone claims all traffic.
            100
        } else if target == active {
            tr.spec.num_desired = desired;
            100
        } else {
            let step = percent_of(desired, increment).max(1);
            let instances = tr.status.num_available.saturating_add(step).min(desired);
            if tr.spec.num_desired < instances {
                info!(
                    %app_target,
                    release = %tr.name(),
                    num_desired = tr.spec.num_desired,
                    new_num_desired = instances,
                    "increasing instances"
                );
                tr.spec.num_desired = instances;
                changed = true;
            }

            let available = tr.status.num_available.min(desired);
            let traffic = share_percent(available, desired)
                .min(prev_traffic + increment)
                .max(prev_traffic)
                .min(100);
            if traffic != prev_traffic {
                changed = true;
            }

            if traffic == 100 {
                info!(%app_target, release = %tr.name(), "target fully deployed, marking as active");
                active = target;
                changed = true;
            } else {
                requeue_after = Some(timeout);
            }
            traffic
        }
    };

    let mut total_traffic = 0;
    for (i, release) in releases.iter_mut().enumerate() {
        if i == active {
            if release.spec.role != ReleaseRole::Active {
                info!(
                    %app_target,
                    release = %release.name(),
                    old_role = ?release.spec.role,
                    "setting release role to active"
                );
            }
            release.spec.role = ReleaseRole::Active;
            if i == target {
                release.spec.traffic_percentage = target_traffic;
            } else {
                // Shrink in proportion to the traffic it still had.
                let prev = release.spec.traffic_percentage;
                let mut count = percent_of(desired, prev);
                if desired > 0 && count < 1 && prev != 0 {
                    count = 1;
                }
                if count != release.spec.num_desired {
                    info!(%app_target, release = %release.name(), count, "scaling down active release");
                }
                release.spec.num_desired = count;
                release.spec.traffic_percentage = 100 - target_traffic;
            }
        } else if i == target {
            if release.spec.traffic_percentage != target_traffic {
                info!(
                    %app_target,
                    release = %release.name(),
                    traffic = target_traffic,
                    last_traffic = release.spec.traffic_percentage,
                    "updating traffic"
                );
            }
            release.spec.role = ReleaseRole::Target;
            release.spec.traffic_percentage = target_traffic;
        } else if release.spec.role == ReleaseRole::Bad {
            release.spec.traffic_percentage = 0;
            release.spec.num_desired = 0;
        } else {
            let prev_role = release.spec.role;
            release.spec.role = ReleaseRole::None;
            release.spec.traffic_percentage = 0;

            // Drain only after traffic has been away for a full timeout.
            let since_change = now.saturating_sub(release.status.state_changed_at);
            if prev_role != ReleaseRole::Active && since_change > timeout_secs {
                if release.spec.num_desired != 0 {
                    info!(%app_target, release = %release.name(), "scaling down instances to zero");
                }
                release.spec.num_desired = 0;
            } else {
                requeue_after = Some(timeout);
            }
        }
        total_traffic += release.spec.traffic_percentage;
    }

    for (i, release) in releases.iter_mut().enumerate() {
        if i == target && target != active {
            release
                .meta
                .labels
                .insert(PROMOTION_TARGET_LABEL.to_string(), "1".to_string());
        } else {
            release.meta.labels.remove(PROMOTION_TARGET_LABEL);
        }
    }

    // Absorb rounding on the target so the split always sums to 100.
    if total_traffic != 100 {
        let tr = &mut releases[target].spec;
        tr.traffic_percentage = (tr.traffic_percentage + 100).saturating_sub(total_traffic);
    }

    at.status.active_release = releases[active].name().to_string();
    at.status.target_release = releases[target].name().to_string();
    if changed || at.status.deploy_updated_at == 0 {
        at.status.deploy_updated_at = now;
    }

    let tr = &releases[target];
    at.status.phase = if at.spec.deploy_mode == DeployMode::Halt {
        AppTargetPhase::Halted
    } else if active != target || tr.status.num_available < tr.spec.num_desired {
        AppTargetPhase::Deploying
    } else {
        AppTargetPhase::Running
    };

    // Mid-rollout counts are transient; only mirror the settled release.
    let ar = &releases[active];
    if active == target && ar.meta.is_persisted() {
        at.status.num_desired = ar.status.num_desired;
        at.status.num_ready = ar.status.num_ready;
        at.status.num_available = ar.status.num_available;
    }

    Ok(RampOutcome {
        requeue_after,
        changed,
    })
}

/// `percent` percent of `total`, rounded down.
fn percent_of(total: u32, percent: u32) -> u32 {
    let scaled = u64::from(total) * u64::from(percent) / 100;
    u32::try_from(scaled).unwrap_or(u32::MAX)
}

/// `part` as a whole percentage of `total`, rounded down.
fn share_percent(part: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let scaled = u64::from(part) * 100 / u64::from(total);
    u32::try_from(scaled).unwrap_or(u32::MAX)
}
