//! Release → replica group translation.

use std::collections::BTreeMap;

use flotilla_state::labels::{self, BUILD_LABEL, RELEASE_LABEL};
use flotilla_state::*;

use crate::error::{HealthError, HealthResult};

/// In-cluster DNS name of a service.
pub fn service_hostname(namespace: &str, service: &str) -> String {
    format!("{service}.{namespace}.svc.cluster.local")
}

/// Labels stamped on a release's replica group and every instance of it.
pub fn workload_labels(release: &AppRelease) -> BTreeMap<String, String> {
    let mut labels = labels::target_labels(&release.spec.app, &release.spec.target);
    labels.insert(RELEASE_LABEL.to_string(), release.name().to_string());
    labels.insert(BUILD_LABEL.to_string(), release.spec.build.clone());
    labels
}

/// `{APP}_{PORT}_HOST` variables for every declared dependency, resolved
/// against the dependency's own descriptor.
pub fn dependency_env(store: &ObjectStore, release: &AppRelease) -> HealthResult<Vec<EnvVar>> {
    let mut env = Vec::new();
    for dep in &release.spec.runtime.dependencies {
        let target = dep.target.as_deref().unwrap_or(&release.spec.target);
        let name = AppTarget::scoped_name(&dep.name, target);
        let Some(at) = store.get::<AppTargetSpec>("", &name)? else {
            return Err(HealthError::MissingDependency {
                app: dep.name.clone(),
                target: target.to_string(),
            });
        };

        let host = service_hostname(at.target_namespace(), &dep.name);
        for port in &at.spec.runtime.ports {
            if dep.port.as_ref().is_some_and(|p| *p != port.name) {
                continue;
            }
            env.push(EnvVar {
                name: format!(
                    "{}_{}_HOST",
                    EnvVar::normalize_name(&dep.name),
                    EnvVar::normalize_name(&port.name)
                ),
                value: format!("{host}:{}", port.port),
            });
        }
    }
    Ok(env)
}

/// Desired replica group for `release`. Config entries come first in key
/// order, followed by dependency addresses.
pub fn replica_group_for(
    release: &AppRelease,
    build: &Build,
    config: Option<&ConfigMap>,
    dependencies: Vec<EnvVar>,
) -> ReplicaGroup {
    let runtime = &release.spec.runtime;
    let labels = workload_labels(release);

    let mut env: Vec<EnvVar> = config
        .map(|cm| {
            cm.spec
                .data
                .iter()
                .map(|(name, value)| EnvVar {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect()
        })
        .unwrap_or_default();
    env.extend(dependencies);

    let container = Container {
        name: release.spec.app.clone(),
        image: build.spec.full_image_with_tag(),
        command: runtime.command.clone(),
        args: runtime.args.clone(),
        env,
        ports: runtime.ports.clone(),
        resources: runtime.resources.clone(),
        liveness_probe: runtime.probes.liveness.clone(),
        readiness_probe: runtime.probes.readiness.clone(),
        startup_probe: runtime.probes.startup.clone(),
    };

    let mut meta = ObjectMeta::new(&release.meta.namespace, release.name());
    meta.labels = labels.clone();
    meta.owner = Some(release.key());

    Object::new(
        meta,
        ReplicaGroupSpec {
            replicas: release.spec.num_desired,
            selector: labels.clone(),
            template: PodTemplate {
                labels,
                containers: vec![container],
                service_account: runtime.service_account.clone(),
                image_pull_secrets: runtime.image_pull_secrets.clone(),
            },
        },
    )
}
