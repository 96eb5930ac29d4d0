//! Release reconciler.

use tracing::{debug, info};

use flotilla_runtime::{Action, Reconciler};
use flotilla_state::labels::{self, PROMOTION_TARGET_LABEL};
use flotilla_state::*;

use crate::error::{HealthError, HealthResult};
use crate::status::{ObservedCounts, diagnose, next_status};
use crate::translator::{dependency_env, replica_group_for};

/// Keeps each release's replica group in line with the release and
/// reports the group's health back onto the release status.
pub struct ReleaseReconciler {
    store: ObjectStore,
}

impl ReleaseReconciler {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    pub fn reconcile_at(&self, key: &str, now: u64) -> HealthResult<Action> {
        let (namespace, name) = split_key(key);
        let Some(release) = self.store.get::<AppReleaseSpec>(namespace, name)? else {
            if self.store.delete::<ReplicaGroupSpec>(namespace, name)? {
                info!(release = %key, "deleted replica group of removed release");
            }
            return Ok(Action::await_change());
        };

        let group = if release.spec.num_desired == 0 {
            if self.store.delete::<ReplicaGroupSpec>(namespace, name)? {
                info!(release = %key, "scaled to zero, replica group deleted");
            }
            None
        } else if let Some(live) = self.autoscaled_group(&release)? {
            debug!(release = %key, replicas = live.spec.replicas, "autoscaler owns instance count");
            Some(live)
        } else {
            let desired = self.desired_group(&release)?;
            let (group, changed) = self.store.apply(desired)?;
            if changed {
                info!(
                    release = %key,
                    replicas = group.spec.replicas,
                    available = group.status.available_replicas,
                    "updated replica group"
                );
            }
            Some(group)
        };

        let counts = ObservedCounts::from_group(group.as_ref());
        let diagnosis = if counts.available < release.spec.num_desired {
            let instances: Vec<Instance> = self
                .store
                .list_matching::<InstanceSpec>(&labels::release_selector(name))?
                .into_iter()
                .filter(|i| i.meta.namespace == namespace)
                .collect();
            Some(diagnose(&instances, release.spec.runtime.probes.readiness_timeout(), now))
        } else {
            None
        };

        let status = next_status(&release, counts, diagnosis, now);
        if status != release.status {
            if status.state != release.status.state {
                info!(
                    release = %key,
                    from = ?release.status.state,
                    to = ?status.state,
                    "release state changed"
                );
            }
            debug!(
                release = %key,
                num_desired = status.num_desired,
                num_available = status.num_available,
                pod_errors = status.pod_errors.len(),
                "updating release status"
            );
            self.store
                .modify_status::<AppReleaseSpec, _>(namespace, name, |_, s| {
                    *s = status.clone();
                })?;
        }

        Ok(Action::await_change())
    }

    /// Translate `release` against its build, config map and dependencies.
    fn desired_group(&self, release: &AppRelease) -> HealthResult<ReplicaGroup> {
        let build = self
            .store
            .get::<BuildSpec>("", &release.spec.build)?
            .ok_or_else(|| HealthError::MissingBuild(release.spec.build.clone()))?;
        let config = if release.spec.config.is_empty() {
            None
        } else {
            self.store
                .get::<ConfigMapSpec>(&release.meta.namespace, &release.spec.config)?
        };
        let dependencies = dependency_env(&self.store, release)?;
        Ok(replica_group_for(release, &build, config.as_ref(), dependencies))
    }

    /// The live replica group when the autoscaler, not the release, decides
    /// its size: the release is active and not mid-promotion, a scaler is
    /// bound to it, and both the release and the live group want instances.
    ///
    /// The live count is read before the translator's write, so a scaler
    /// attaching in between can see one overwrite.
    fn autoscaled_group(&self, release: &AppRelease) -> HealthResult<Option<ReplicaGroup>> {
        if release.spec.role != ReleaseRole::Active
            || release.meta.label(PROMOTION_TARGET_LABEL).is_some()
            || release.spec.num_desired == 0
        {
            return Ok(None);
        }
        let Some(live) = self
            .store
            .get::<ReplicaGroupSpec>(&release.meta.namespace, release.name())?
        else {
            return Ok(None);
        };
        if live.spec.replicas == 0 {
            return Ok(None);
        }
        let bound = self
            .store
            .list_matching::<AutoscalerSpec>(&labels::release_selector(release.name()))?
            .iter()
            .any(|s| s.meta.namespace == release.meta.namespace);
        Ok(bound.then_some(live))
    }
}

impl Reconciler for ReleaseReconciler {
    type Error = HealthError;
    const NAME: &'static str = "release";

    fn reconcile(&self, key: &str) -> Result<Action, Self::Error> {
        self.reconcile_at(key, epoch_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_state::labels::RELEASE_LABEL;

    const NOW: u64 = 1_700_000_000;

    fn build() -> Build {
        Object::new(
            ObjectMeta::new("", "web-v1-abcd"),
            BuildSpec {
                registry: String::new(),
                image: "web".to_string(),
                tag: "v1".to_string(),
                created_at: NOW - 3600,
            },
        )
    }

    fn release(role: ReleaseRole, num_desired: u32) -> AppRelease {
        Object::new(
            ObjectMeta::new("prod", "web-1"),
            AppReleaseSpec {
                app: "web".to_string(),
                target: "prod".to_string(),
                build: "web-v1-abcd".to_string(),
                config: String::new(),
                num_desired,
                role,
                traffic_percentage: 100,
                runtime: RuntimeSpec::default(),
            },
        )
    }

    fn setup(release: AppRelease) -> (ObjectStore, ReleaseReconciler) {
        let store = ObjectStore::open_in_memory().unwrap();
        store.create(build()).unwrap();
        store.create(release).unwrap();
        let reconciler = ReleaseReconciler::new(store.clone());
        (store, reconciler)
    }

    fn group(store: &ObjectStore) -> Option<ReplicaGroup> {
        store.get::<ReplicaGroupSpec>("prod", "web-1").unwrap()
    }

    fn stored(store: &ObjectStore) -> AppRelease {
        store.get::<AppReleaseSpec>("prod", "web-1").unwrap().unwrap()
    }

    fn set_group_status(store: &ObjectStore, ready: u32, available: u32) {
        store
            .modify_status::<ReplicaGroupSpec, _>("prod", "web-1", |_, s| {
                s.ready_replicas = ready;
                s.available_replicas = available;
            })
            .unwrap();
    }

    #[test]
    fn creates_replica_group_and_reports_releasing() {
        let (store, reconciler) = setup(release(ReleaseRole::Active, 3));
        reconciler.reconcile_at("prod/web-1", NOW).unwrap();

        let g = group(&store).unwrap();
        assert_eq!(g.spec.replicas, 3);
        assert_eq!(g.spec.template.containers[0].image, "web:v1");

        let r = stored(&store);
        assert_eq!(r.status.state, ReleaseState::Releasing);
        assert_eq!(r.status.num_desired, 3);
        assert_eq!(r.status.state_changed_at, NOW);
    }

    #[test]
    fn fully_available_active_is_released() {
        let (store, reconciler) = setup(release(ReleaseRole::Active, 3));
        reconciler.reconcile_at("prod/web-1", NOW).unwrap();
        set_group_status(&store, 3, 3);
        reconciler.reconcile_at("prod/web-1", NOW + 30).unwrap();

        let r = stored(&store);
        assert_eq!(r.status.state, ReleaseState::Released);
        assert_eq!(r.status.num_available, 3);
        assert_eq!(r.status.state_changed_at, NOW + 30);

        // Nothing changed: no status write.
        let version = r.meta.status_version;
        reconciler.reconcile_at("prod/web-1", NOW + 60).unwrap();
        assert_eq!(stored(&store).meta.status_version, version);
    }

    #[test]
    fn zero_desired_deletes_group() {
        let (store, reconciler) = setup(release(ReleaseRole::None, 2));
        reconciler.reconcile_at("prod/web-1", NOW).unwrap();
        assert!(group(&store).is_some());
        assert_eq!(stored(&store).status.state, ReleaseState::Retiring);

        store
            .modify_spec::<AppReleaseSpec, _>("prod", "web-1", |r| r.spec.num_desired = 0)
            .unwrap();
        reconciler.reconcile_at("prod/web-1", NOW + 1).unwrap();
        assert!(group(&store).is_none());
        assert_eq!(stored(&store).status.state, ReleaseState::Retired);
    }

    #[test]
    fn zero_desired_drains_without_resolving_dependencies() {
        let mut rel = release(ReleaseRole::None, 2);
        rel.spec.runtime.dependencies = vec![AppReference {
            name: "billing".to_string(),
            target: None,
            port: None,
        }];
        let (store, reconciler) = setup(rel);
        store
            .create(Object::new(
                ObjectMeta::new("", &AppTarget::scoped_name("billing", "prod")),
                AppTargetSpec {
                    app: "billing".to_string(),
                    target: "prod".to_string(),
                    build: "billing-v1".to_string(),
                    deploy_mode: DeployMode::Latest,
                    runtime: RuntimeSpec::default(),
                    configs: Vec::new(),
                    scale: ScaleSpec::default(),
                    ingress: None,
                },
            ))
            .unwrap();
        reconciler.reconcile_at("prod/web-1", NOW).unwrap();
        assert_eq!(group(&store).unwrap().spec.replicas, 2);

        store
            .delete::<AppTargetSpec>("", &AppTarget::scoped_name("billing", "prod"))
            .unwrap();
        assert!(matches!(
            reconciler.reconcile_at("prod/web-1", NOW + 1),
            Err(HealthError::MissingDependency { .. })
        ));

        store
            .modify_spec::<AppReleaseSpec, _>("prod", "web-1", |r| r.spec.num_desired = 0)
            .unwrap();
        assert_eq!(reconciler.reconcile_at("prod/web-1", NOW + 2).unwrap(), Action::AwaitChange);
        assert!(group(&store).is_none());
        assert_eq!(stored(&store).status.state, ReleaseState::Retired);
    }

    #[test]
    fn removed_release_takes_its_group() {
        let (store, reconciler) = setup(release(ReleaseRole::Active, 1));
        reconciler.reconcile_at("prod/web-1", NOW).unwrap();
        store.delete::<AppReleaseSpec>("prod", "web-1").unwrap();

        assert_eq!(reconciler.reconcile_at("prod/web-1", NOW).unwrap(), Action::AwaitChange);
        assert!(group(&store).is_none());
    }

    #[test]
    fn autoscaler_owned_count_is_not_overwritten() {
        let (store, reconciler) = setup(release(ReleaseRole::Active, 2));
        reconciler.reconcile_at("prod/web-1", NOW).unwrap();

        store
            .create(Object::new(
                ObjectMeta::new("prod", "web-scaler").with_labels([(RELEASE_LABEL, "web-1")]),
                AutoscalerSpec {
                    release: "web-1".to_string(),
                    min_replicas: 1,
                    max_replicas: 10,
                    target_cpu_utilization: 70,
                },
            ))
            .unwrap();
        store
            .modify_spec::<ReplicaGroupSpec, _>("prod", "web-1", |g| g.spec.replicas = 6)
            .unwrap();

        reconciler.reconcile_at("prod/web-1", NOW + 1).unwrap();
        assert_eq!(group(&store).unwrap().spec.replicas, 6);
        assert_eq!(stored(&store).status.num_desired, 6);

        // Mid-promotion the release owns the count again.
        store
            .modify_spec::<AppReleaseSpec, _>("prod", "web-1", |r| {
                r.meta
                    .labels
                    .insert(PROMOTION_TARGET_LABEL.to_string(), "1".to_string());
            })
            .unwrap();
        reconciler.reconcile_at("prod/web-1", NOW + 2).unwrap();
        assert_eq!(group(&store).unwrap().spec.replicas, 2);
    }

    #[test]
    fn never_running_release_fails() {
        let (store, reconciler) = setup(release(ReleaseRole::Target, 1));
        reconciler.reconcile_at("prod/web-1", NOW).unwrap();

        let mut meta = ObjectMeta::new("prod", "web-1-x7k2").with_labels([(RELEASE_LABEL, "web-1")]);
        meta.created_at = NOW - 120;
        let mut inst = Object::new(meta, InstanceSpec::default());
        inst.status.container_statuses.push(ContainerStatus {
            name: "web".to_string(),
            state: ContainerState::Waiting {
                reason: "ImagePullBackOff".to_string(),
                message: "pull access denied".to_string(),
            },
            last_termination: None,
        });
        store.create(inst).unwrap();

        reconciler.reconcile_at("prod/web-1", NOW).unwrap();
        let r = stored(&store);
        assert_eq!(r.status.state, ReleaseState::Failed);
        assert_eq!(r.status.pod_errors.len(), 1);
        assert_eq!(r.status.pod_errors[0].reason, "ImagePullBackOff");
    }

    #[test]
    fn missing_build_fails_the_pass() {
        let store = ObjectStore::open_in_memory().unwrap();
        store.create(release(ReleaseRole::Active, 1)).unwrap();
        let reconciler = ReleaseReconciler::new(store);
        assert!(matches!(
            reconciler.reconcile_at("prod/web-1", NOW),
            Err(HealthError::MissingBuild(_))
        ));
    }
}
