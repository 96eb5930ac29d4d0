//! Well-known label keys.

use std::collections::BTreeMap;

use crate::meta::LabelSelector;

pub const APP_LABEL: &str = "flotilla.dev/app";
pub const TARGET_LABEL: &str = "flotilla.dev/target";
pub const BUILD_LABEL: &str = "flotilla.dev/build";
pub const RELEASE_LABEL: &str = "flotilla.dev/release";
pub const SHARED_CONFIG_LABEL: &str = "flotilla.dev/sharedConfig";

/// Fingerprint of the descriptor fields that shape the running container.
pub const TARGET_HASH_LABEL: &str = "flotilla.dev/targetHash";
/// Content hash of the merged configuration a release was cut from.
pub const CONFIG_HASH_LABEL: &str = "flotilla.dev/configHash";

/// Present (value `"1"`) only on a release that is mid-promotion. Its absence
/// on the active release hands instance-count ownership to the autoscaler.
pub const PROMOTION_TARGET_LABEL: &str = "flotilla.dev/promotionTarget";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "flotilla";

/// Labels shared by everything derived from one descriptor.
pub fn target_labels(app: &str, target: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), app.to_string()),
        (TARGET_LABEL.to_string(), target.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
    ])
}

/// Selects everything derived from one descriptor.
pub fn target_selector(app: &str, target: &str) -> LabelSelector {
    LabelSelector::new()
        .with(APP_LABEL, app)
        .with(TARGET_LABEL, target)
}

/// Selects the workload objects of one release.
pub fn release_selector(release: &str) -> LabelSelector {
    LabelSelector::new().with(RELEASE_LABEL, release)
}
