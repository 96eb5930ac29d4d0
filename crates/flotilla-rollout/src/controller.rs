//! Deployment reconciler.
//!
//! One pass over a descriptor: resolve configuration, make sure a release
//! exists for the current (build, descriptor, config) fingerprint, run the
//! ramp, persist the releases it touched, expire old ones, then bring the
//! autoscaler, routing list and descriptor status in line.

use std::sync::Arc;

use tracing::{debug, info};

use flotilla_autoscale::AutoscalerCoordinator;
use flotilla_runtime::{Action, Reconciler};
use flotilla_state::labels::{self, BUILD_LABEL, CONFIG_HASH_LABEL, TARGET_HASH_LABEL};
use flotilla_state::*;

use crate::config::{ConfigSource, ResolvedConfig, StoreConfigSource, ensure_config_map};
use crate::error::{RolloutError, RolloutResult};
use crate::naming::{release_fingerprint, release_name, sort_newest_first, target_fingerprint};
use crate::ramp::deploy_releases;
use crate::retention::collect_garbage;
use crate::routing::publish_traffic_split;

pub struct DeploymentReconciler {
    store: ObjectStore,
    configs: Arc<dyn ConfigSource>,
    autoscalers: AutoscalerCoordinator,
}

impl DeploymentReconciler {
    pub fn new(store: ObjectStore) -> Self {
        let configs = Arc::new(StoreConfigSource::new(store.clone()));
        Self::with_config_source(store, configs)
    }

    pub fn with_config_source(store: ObjectStore, configs: Arc<dyn ConfigSource>) -> Self {
        Self {
            autoscalers: AutoscalerCoordinator::new(store.clone()),
            store,
            configs,
        }
    }

    /// Reconcile the descriptor stored under `key` as of `now`.
    pub fn reconcile_at(&self, key: &str, now: u64) -> RolloutResult<Action> {
        let Some(mut at) = self.store.get_by_key::<AppTargetSpec>(key)? else {
            let removed = self.remove_owned(key)?;
            debug!(app_target = %key, removed, "descriptor gone");
            return Ok(Action::await_change());
        };
        let observed = at.status.clone();

        let config = self.configs.resolve(&at)?;
        let config_map = match &config {
            Some(config) => Some(ensure_config_map(&self.store, &at, config)?),
            None => None,
        };

        let build = self
            .store
            .get::<BuildSpec>("", &at.spec.build)?
            .ok_or_else(|| RolloutError::MissingBuild(at.spec.build.clone()))?;

        let mut releases = self
            .store
            .list_matching::<AppReleaseSpec>(&labels::target_selector(&at.spec.app, &at.spec.target))?;

        let target_hash = target_fingerprint(&at.spec)?;
        let current = releases.iter().any(|r| {
            r.meta.label(TARGET_HASH_LABEL) == Some(target_hash.as_str())
                && config_map.as_deref().is_none_or(|name| r.spec.config == name)
        });
        if !current {
            let release = release_for_target(&at, &build, &target_hash, config.as_ref().zip(config_map.as_deref()));
            info!(
                app_target = %at.name(),
                release = %release.name(),
                build = %build.name(),
                config = %release.spec.config,
                "creating new release"
            );
            releases.push(release);
        }

        sort_newest_first(&mut releases);
        let before = releases.clone();
        let outcome = deploy_releases(&mut at, &mut releases, now)?;

        // The ramp cooldown reads this timestamp, so it lands before any
        // release write it paces.
        if at.status.deploy_updated_at != observed.deploy_updated_at {
            let stamp = at.status.deploy_updated_at;
            self.store
                .modify_status::<AppTargetSpec, _>(&at.meta.namespace, &at.meta.name, |_, s| {
                    s.deploy_updated_at = stamp;
                })?;
            debug!(app_target = %at.name(), deploy_updated_at = stamp, "ramp step recorded");
        }

        for (release, previous) in releases.iter_mut().zip(&before) {
            if !release.meta.is_persisted() {
                *release = self.store.create(release.clone())?;
            } else if *release != *previous {
                *release = self.store.update_spec(release)?;
                debug!(
                    release = %release.name(),
                    role = ?release.spec.role,
                    traffic = release.spec.traffic_percentage,
                    num_desired = release.spec.num_desired,
                    "release updated"
                );
            }
        }

        collect_garbage(&self.store, &releases, now)?;

        self.autoscalers.reconcile(&mut at, &releases)?;
        publish_traffic_split(&self.store, &at, &releases)?;

        if at.status != observed {
            let status = at.status.clone();
            self.store
                .modify_status::<AppTargetSpec, _>(&at.meta.namespace, &at.meta.name, |_, s| {
                    *s = status.clone();
                })?;
            info!(
                app_target = %at.name(),
                phase = ?at.status.phase,
                active = %at.status.active_release,
                target = %at.status.target_release,
                "status updated"
            );
        }

        Ok(outcome
            .requeue_after
            .map_or(Action::await_change(), Action::requeue))
    }

    /// Delete everything the descriptor under `key` owned. Replica groups
    /// follow their releases through the release reconciler.
    fn remove_owned(&self, key: &str) -> RolloutResult<usize> {
        let mut removed = 0;
        removed += delete_owned::<AppReleaseSpec>(&self.store, key)?;
        removed += delete_owned::<AutoscalerSpec>(&self.store, key)?;
        removed += delete_owned::<TrafficSplitSpec>(&self.store, key)?;
        removed += delete_owned::<ConfigMapSpec>(&self.store, key)?;
        Ok(removed)
    }
}

fn delete_owned<S: ResourceSpec>(store: &ObjectStore, owner: &str) -> RolloutResult<usize> {
    let mut removed = 0;
    for obj in store.list::<S>()? {
        if obj.meta.owner.as_deref() == Some(owner)
            && store.delete::<S>(&obj.meta.namespace, &obj.meta.name)?
        {
            removed += 1;
        }
    }
    Ok(removed)
}

/// A fresh, unpersisted release of `at` running `build` with `config`
/// (resolved content and config map name).
pub fn release_for_target(
    at: &AppTarget,
    build: &Build,
    target_hash: &str,
    config: Option<(&ResolvedConfig, &str)>,
) -> AppRelease {
    let fingerprint = release_fingerprint(target_hash, config.map(|(c, _)| c.hash.as_str()));
    let name = release_name(&at.spec.app, build.spec.created_at, &fingerprint);

    let mut meta = ObjectMeta::new(at.target_namespace(), &name);
    meta.labels = labels::target_labels(&at.spec.app, &at.spec.target);
    meta.labels
        .insert(BUILD_LABEL.to_string(), build.name().to_string());
    meta.labels
        .insert(TARGET_HASH_LABEL.to_string(), target_hash.to_string());
    if let Some((resolved, _)) = config {
        meta.labels
            .insert(CONFIG_HASH_LABEL.to_string(), resolved.hash.clone());
    }
    meta.owner = Some(at.key());

    Object::new(
        meta,
        AppReleaseSpec {
            app: at.spec.app.clone(),
            target: at.spec.target.clone(),
            build: build.name().to_string(),
            config: config.map(|(_, name)| name.to_string()).unwrap_or_default(),
            num_desired: 0,
            role: ReleaseRole::None,
            traffic_percentage: 0,
            runtime: at.spec.runtime.clone(),
        },
    )
}

impl Reconciler for DeploymentReconciler {
    type Error = RolloutError;
    const NAME: &'static str = "deployment";

    fn reconcile(&self, key: &str) -> Result<Action, Self::Error> {
        self.reconcile_at(key, epoch_secs())
    }

    fn is_retryable(&self, error: &Self::Error) -> bool {
        error.is_retryable()
    }
}
