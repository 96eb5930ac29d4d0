//! Horizontal scaler: CPU-driven replica counts for bound releases.
//!
//! Reads each autoscaler's release instances from the object store, compares
//! their mean CPU utilization against the autoscaler's target, and writes
//! the new replica count straight onto the release's replica group. The
//! release translator leaves that count alone while the scaler owns it.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use flotilla_state::labels;
use flotilla_state::*;

use crate::error::AutoscaleResult;

/// Utilization within this fraction of the target is left alone.
const TOLERANCE: f64 = 0.1;

/// A scaling decision for a single autoscaler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Scale to the specified replica count.
    ScaleTo(u32),
    /// No change needed.
    NoChange,
}

/// Per-autoscaler cooldown tracking.
#[derive(Default)]
struct ScaleState {
    last_scale_up: u64,
    last_scale_down: u64,
}

pub struct HorizontalScaler {
    store: ObjectStore,
    scale_states: HashMap<String, ScaleState>,
    scale_up_window: Duration,
    scale_down_window: Duration,
}

impl HorizontalScaler {
    pub fn new(store: ObjectStore) -> Self {
        Self {
            store,
            scale_states: HashMap::new(),
            scale_up_window: Duration::ZERO,
            scale_down_window: Duration::from_secs(300),
        }
    }

    /// Override the cooldown windows.
    pub fn with_windows(mut self, scale_up: Duration, scale_down: Duration) -> Self {
        self.scale_up_window = scale_up;
        self.scale_down_window = scale_down;
        self
    }

    /// Decide the replica count for one autoscaler.
    ///
    /// `utilization` is the mean CPU utilization (percent of request) across
    /// running instances, `None` when nothing has reported yet.
    pub fn evaluate(
        &mut self,
        scaler: &Autoscaler,
        current: u32,
        utilization: Option<u32>,
        now: u64,
    ) -> ScaleDecision {
        let spec = &scaler.spec;
        // Zero replicas means the release is halted or draining.
        if current == 0 {
            return ScaleDecision::NoChange;
        }

        let min = spec.min_replicas.max(1);
        let max = spec.max_replicas.max(min);
        let mut desired = current;
        if let Some(utilization) = utilization
            && spec.target_cpu_utilization > 0
        {
            let ratio = utilization as f64 / spec.target_cpu_utilization as f64;
            if (ratio - 1.0).abs() > TOLERANCE {
                desired = (current as f64 * ratio).ceil() as u32;
            }
        }
        let desired = desired.clamp(min, max);
        if desired == current {
            return ScaleDecision::NoChange;
        }

        let state = self.scale_states.entry(scaler.key()).or_default();
        if desired > current {
            if now.saturating_sub(state.last_scale_up) < self.scale_up_window.as_secs() {
                return ScaleDecision::NoChange;
            }
            state.last_scale_up = now;
        } else {
            if now.saturating_sub(state.last_scale_down) < self.scale_down_window.as_secs() {
                return ScaleDecision::NoChange;
            }
            state.last_scale_down = now;
        }

        debug!(
            scaler = %scaler.key(),
            from = current,
            to = desired,
            utilization,
            target = spec.target_cpu_utilization,
            "scaling"
        );
        ScaleDecision::ScaleTo(desired)
    }

    /// Mean reported CPU utilization across the release's running instances.
    fn utilization(&self, namespace: &str, release: &str) -> AutoscaleResult<Option<u32>> {
        let instances = self
            .store
            .list_matching::<InstanceSpec>(&labels::release_selector(release))?;
        let samples: Vec<u32> = instances
            .iter()
            .filter(|i| i.meta.namespace == namespace && i.status.phase == InstancePhase::Running)
            .filter_map(|i| i.status.cpu_utilization)
            .collect();
        if samples.is_empty() {
            return Ok(None);
        }
        let total: u64 = samples.iter().map(|&s| s as u64).sum();
        Ok(Some((total / samples.len() as u64) as u32))
    }

    /// Evaluate every autoscaler and apply the decisions.
    pub fn evaluate_all(&mut self) -> AutoscaleResult<Vec<(String, ScaleDecision)>> {
        let now = epoch_secs();
        let mut decisions = Vec::new();

        for scaler in self.store.list::<AutoscalerSpec>()? {
            let namespace = scaler.meta.namespace.clone();
            let release = scaler.spec.release.clone();
            let Some(group) = self.store.get::<ReplicaGroupSpec>(&namespace, &release)? else {
                debug!(scaler = %scaler.key(), %release, "no replica group yet");
                continue;
            };

            let utilization = self.utilization(&namespace, &release)?;
            let current = group.spec.replicas;
            let decision = self.evaluate(&scaler, current, utilization, now);

            let replicas = match decision {
                ScaleDecision::ScaleTo(replicas) => {
                    self.store
                        .modify_spec::<ReplicaGroupSpec, _>(&namespace, &release, |g| {
                            g.spec.replicas = replicas;
                        })?;
                    info!(scaler = %scaler.key(), %release, from = current, to = replicas, "scaled release");
                    replicas
                }
                ScaleDecision::NoChange => current,
            };

            let scaled = matches!(decision, ScaleDecision::ScaleTo(_));
            self.store
                .modify_status::<AutoscalerSpec, _>(&namespace, scaler.name(), |_, status| {
                    status.current_replicas = current;
                    status.desired_replicas = replicas;
                    if scaled {
                        status.last_scale_time = Some(now);
                    }
                })?;

            decisions.push((scaler.key(), decision));
        }

        Ok(decisions)
    }

    /// Run the scaler loop.
    pub async fn run(&mut self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "horizontal scaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.evaluate_all() {
                        warn!(error = %e, "autoscaler evaluation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("horizontal scaler shutting down");
                    break;
                }
            }
        }
    }
}
