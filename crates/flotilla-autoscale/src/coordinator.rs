//! Autoscaler coordinator: binds a horizontal scaler to the settled release.
//!
//! A descriptor gets at most one autoscaler, named `{app}-scaler`, and only
//! while its active release is not being replaced. Any scaler bound to a
//! different release is removed first so two scalers never fight over one
//! descriptor's instance count.

use tracing::{debug, info};

use flotilla_state::labels::{self, RELEASE_LABEL};
use flotilla_state::*;

use crate::error::AutoscaleResult;

/// Conventional autoscaler name for an app.
pub fn scaler_name(app: &str) -> String {
    format!("{app}-scaler")
}

/// Desired autoscaler for `at`, bound to `release`.
pub fn autoscaler_for(at: &AppTarget, release: &AppRelease) -> Autoscaler {
    let min_replicas = at.spec.scale.min.max(1);
    let max_replicas = at.spec.scale.max.max(min_replicas);

    let mut labels = labels::target_labels(&at.spec.app, &at.spec.target);
    labels.insert(RELEASE_LABEL.to_string(), release.name().to_string());

    let mut meta = ObjectMeta::new(at.target_namespace(), &scaler_name(&at.spec.app));
    meta.labels = labels;
    meta.owner = Some(at.key());

    Object::new(
        meta,
        AutoscalerSpec {
            release: release.name().to_string(),
            min_replicas,
            max_replicas,
            target_cpu_utilization: at.spec.scale.target_cpu_utilization,
        },
    )
}

pub struct AutoscalerCoordinator {
    store: ObjectStore,
}

impl AutoscalerCoordinator {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    /// Attach, rebind or detach the descriptor's autoscaler based on the
    /// roles in `releases`. Mirrors the scaler's last scale time into
    /// `at.status`; the caller persists it.
    pub fn reconcile(&self, at: &mut AppTarget, releases: &[AppRelease]) -> AutoscaleResult<()> {
        let active = releases
            .iter()
            .find(|r| r.spec.role == ReleaseRole::Active);
        let promoting = releases
            .iter()
            .any(|r| r.spec.role == ReleaseRole::Target);

        let existing = self
            .store
            .list_matching::<AutoscalerSpec>(&labels::target_selector(&at.spec.app, &at.spec.target))?;

        let active = match active {
            Some(active) if at.needs_autoscaler() && !promoting => active,
            _ => {
                for scaler in &existing {
                    info!(app_target = %at.name(), scaler = %scaler.name(), "deleting unused autoscaler");
                    self.store
                        .delete::<AutoscalerSpec>(&scaler.meta.namespace, &scaler.meta.name)?;
                }
                return Ok(());
            }
        };

        for scaler in &existing {
            if scaler.meta.label(RELEASE_LABEL) != Some(active.name()) {
                info!(
                    app_target = %at.name(),
                    scaler = %scaler.name(),
                    release = scaler.meta.label(RELEASE_LABEL).unwrap_or_default(),
                    "deleting autoscaler for old release"
                );
                self.store
                    .delete::<AutoscalerSpec>(&scaler.meta.namespace, &scaler.meta.name)?;
            }
        }

        let (scaler, changed) = self.store.apply(autoscaler_for(at, active))?;
        if changed {
            info!(
                app_target = %at.name(),
                release = %active.name(),
                min = scaler.spec.min_replicas,
                max = scaler.spec.max_replicas,
                "autoscaler attached"
            );
        } else {
            debug!(app_target = %at.name(), "autoscaler unchanged");
        }

        at.status.last_scaled_at = scaler.status.last_scale_time;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_target(min: u32, max: u32, cpu: bool) -> AppTarget {
        let mut runtime = RuntimeSpec::default();
        if cpu {
            runtime.resources.requests.cpu = Some("250m".to_string());
        }
        Object::new(
            ObjectMeta::new("", "web-prod"),
            AppTargetSpec {
                app: "web".to_string(),
                target: "prod".to_string(),
                build: "web-v1-abcd".to_string(),
                deploy_mode: DeployMode::Latest,
                runtime,
                configs: Vec::new(),
                scale: ScaleSpec {
                    min,
                    max,
                    target_cpu_utilization: 70,
                },
                ingress: None,
            },
        )
    }

    fn release(name: &str, role: ReleaseRole) -> AppRelease {
        Object::new(
            ObjectMeta::new("prod", name),
            AppReleaseSpec {
                app: "web".to_string(),
                target: "prod".to_string(),
                build: "web-v1-abcd".to_string(),
                config: String::new(),
                num_desired: 2,
                role,
                traffic_percentage: 100,
                runtime: RuntimeSpec::default(),
            },
        )
    }

    fn scalers(store: &ObjectStore) -> Vec<Autoscaler> {
        store.list::<AutoscalerSpec>().unwrap()
    }

    #[test]
    fn bounds_are_normalized() {
        let at = app_target(0, 0, true);
        let scaler = autoscaler_for(&at, &release("web-1", ReleaseRole::Active));
        assert_eq!(scaler.meta.name, "web-scaler");
        assert_eq!(scaler.meta.namespace, "prod");
        assert_eq!(scaler.spec.min_replicas, 1);
        assert_eq!(scaler.spec.max_replicas, 1);
        assert_eq!(scaler.meta.label(RELEASE_LABEL), Some("web-1"));
    }

    #[test]
    fn attaches_to_settled_active_release() {
        let store = ObjectStore::open_in_memory().unwrap();
        let coordinator = AutoscalerCoordinator::new(store.clone());
        let mut at = app_target(2, 6, true);

        coordinator
            .reconcile(&mut at, &[release("web-1", ReleaseRole::Active)])
            .unwrap();

        let all = scalers(&store);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].spec.release, "web-1");
        assert_eq!(all[0].spec.min_replicas, 2);
        assert_eq!(all[0].spec.max_replicas, 6);
    }

    #[test]
    fn detaches_during_promotion() {
        let store = ObjectStore::open_in_memory().unwrap();
        let coordinator = AutoscalerCoordinator::new(store.clone());
        let mut at = app_target(2, 6, true);

        coordinator
            .reconcile(&mut at, &[release("web-1", ReleaseRole::Active)])
            .unwrap();
        coordinator
            .reconcile(
                &mut at,
                &[
                    release("web-1", ReleaseRole::Active),
                    release("web-2", ReleaseRole::Target),
                ],
            )
            .unwrap();

        assert!(scalers(&store).is_empty());
    }

    #[test]
    fn rebinds_after_promotion() {
        let store = ObjectStore::open_in_memory().unwrap();
        let coordinator = AutoscalerCoordinator::new(store.clone());
        let mut at = app_target(2, 6, true);

        coordinator
            .reconcile(&mut at, &[release("web-1", ReleaseRole::Active)])
            .unwrap();
        coordinator
            .reconcile(
                &mut at,
                &[
                    release("web-1", ReleaseRole::None),
                    release("web-2", ReleaseRole::Active),
                ],
            )
            .unwrap();

        let all = scalers(&store);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].spec.release, "web-2");
        assert_eq!(all[0].meta.label(RELEASE_LABEL), Some("web-2"));
    }

    #[test]
    fn not_needed_without_cpu_requests_or_range() {
        let store = ObjectStore::open_in_memory().unwrap();
        let coordinator = AutoscalerCoordinator::new(store.clone());

        let mut no_cpu = app_target(2, 6, false);
        coordinator
            .reconcile(&mut no_cpu, &[release("web-1", ReleaseRole::Active)])
            .unwrap();
        assert!(scalers(&store).is_empty());

        let mut fixed = app_target(3, 3, true);
        coordinator
            .reconcile(&mut fixed, &[release("web-1", ReleaseRole::Active)])
            .unwrap();
        assert!(scalers(&store).is_empty());
    }

    #[test]
    fn mirrors_last_scale_time() {
        let store = ObjectStore::open_in_memory().unwrap();
        let coordinator = AutoscalerCoordinator::new(store.clone());
        let mut at = app_target(2, 6, true);
        let releases = [release("web-1", ReleaseRole::Active)];

        coordinator.reconcile(&mut at, &releases).unwrap();
        assert_eq!(at.status.last_scaled_at, None);

        store
            .modify_status::<AutoscalerSpec, _>("prod", "web-scaler", |_, status| {
                status.last_scale_time = Some(1_700_000_000);
            })
            .unwrap();
        coordinator.reconcile(&mut at, &releases).unwrap();
        assert_eq!(at.status.last_scaled_at, Some(1_700_000_000));
    }
}
