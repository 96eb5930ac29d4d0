//! Weighted routing list handed to the mesh configuration generator.

use tracing::debug;

use flotilla_state::labels;
use flotilla_state::*;

use crate::error::RolloutResult;

/// The descriptor's traffic split: every release currently taking traffic.
pub fn traffic_split_for(at: &AppTarget, releases: &[AppRelease]) -> TrafficSplit {
    let routes = releases
        .iter()
        .filter(|r| r.spec.traffic_percentage > 0)
        .map(|r| WeightedRoute {
            release: r.name().to_string(),
            role: r.spec.role,
            weight: r.spec.traffic_percentage,
            ports: r.spec.runtime.ports.clone(),
        })
        .collect();

    let mut meta = ObjectMeta::new(at.target_namespace(), &at.spec.app);
    meta.labels = labels::target_labels(&at.spec.app, &at.spec.target);
    meta.owner = Some(at.key());

    Object::new(
        meta,
        TrafficSplitSpec {
            app: at.spec.app.clone(),
            target: at.spec.target.clone(),
            routes,
        },
    )
}

/// Write the split if it differs from what is stored. Returns whether it
/// changed.
pub fn publish_traffic_split(store: &ObjectStore, at: &AppTarget, releases: &[AppRelease]) -> RolloutResult<bool> {
    let (split, changed) = store.apply(traffic_split_for(at, releases))?;
    if changed {
        debug!(
            app_target = %at.name(),
            routes = ?split.spec.routes.iter().map(|r| (&r.release, r.weight)).collect::<Vec<_>>(),
            "traffic split updated"
        );
    }
    Ok(changed)
}
