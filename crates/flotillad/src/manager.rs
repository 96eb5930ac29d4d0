//! Controller manager: turns store changes into reconcile keys.
//!
//! Deployment keys are descriptor keys, release keys are release keys.
//! Derived objects point back at what they came from through their owner
//! or the release label, so every event lands on the reconciler that has
//! to look again.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use flotilla_autoscale::HorizontalScaler;
use flotilla_health::ReleaseReconciler;
use flotilla_rollout::DeploymentReconciler;
use flotilla_runtime::{Controller, QueueHandle};
use flotilla_state::labels::{APP_LABEL, RELEASE_LABEL, SHARED_CONFIG_LABEL};
use flotilla_state::*;

use crate::config::ControllerSection;

/// Routes watch events and periodic resyncs into the two work queues.
#[derive(Clone)]
pub struct Triggers {
    store: ObjectStore,
    deployments: QueueHandle,
    releases: QueueHandle,
}

impl Triggers {
    pub fn new(store: ObjectStore, deployments: QueueHandle, releases: QueueHandle) -> Self {
        Self {
            store,
            deployments,
            releases,
        }
    }

    /// Enqueue whatever `event` affects.
    pub fn route(&self, event: &WatchEvent) -> StateResult<()> {
        let kind = event.kind;
        if kind == AppTargetSpec::KIND {
            self.deployments.enqueue(&event.key);
        } else if kind == AppReleaseSpec::KIND {
            self.releases.enqueue(&event.key);
            if let Some(owner) = &event.owner {
                self.deployments.enqueue(owner);
            }
        } else if kind == ReplicaGroupSpec::KIND || kind == InstanceSpec::KIND {
            if let Some(release) = self.owning_release(event) {
                self.releases.enqueue(&release);
            }
        } else if kind == AutoscalerSpec::KIND {
            if let Some(owner) = &event.owner {
                self.deployments.enqueue(owner);
            }
        } else if kind == BuildSpec::KIND {
            let (_, build) = split_key(&event.key);
            self.enqueue_descriptors(|at| at.spec.build == build)?;
        } else if kind == AppConfigSpec::KIND {
            let app = event.labels.get(APP_LABEL);
            let shared = event.labels.get(SHARED_CONFIG_LABEL);
            self.enqueue_descriptors(|at| {
                app.is_some_and(|app| *app == at.spec.app)
                    || shared.is_some_and(|name| at.spec.configs.contains(name))
            })?;
        }
        // Config maps and traffic splits are written by the deployment
        // reconciler itself.
        Ok(())
    }

    /// Replica groups are owned by their release; instances only carry the
    /// release label.
    fn owning_release(&self, event: &WatchEvent) -> Option<String> {
        if event.kind == ReplicaGroupSpec::KIND
            && let Some(owner) = &event.owner
        {
            return Some(owner.clone());
        }
        let (namespace, _) = split_key(&event.key);
        event
            .labels
            .get(RELEASE_LABEL)
            .map(|release| object_key(namespace, release))
    }

    fn enqueue_descriptors(&self, matches: impl Fn(&AppTarget) -> bool) -> StateResult<()> {
        for at in self.store.list::<AppTargetSpec>()? {
            if matches(&at) {
                self.deployments.enqueue(&at.key());
            }
        }
        Ok(())
    }

    /// Enqueue every descriptor and release. Returns the number of keys.
    pub fn resync(&self) -> StateResult<usize> {
        let mut keys = 0;
        for at in self.store.list::<AppTargetSpec>()? {
            self.deployments.enqueue(&at.key());
            keys += 1;
        }
        for release in self.store.list::<AppReleaseSpec>()? {
            self.releases.enqueue(&release.key());
            keys += 1;
        }
        Ok(keys)
    }

    fn resync_logged(&self) {
        match self.resync() {
            Ok(keys) => debug!(keys, "resync"),
            Err(e) => warn!(error = %e, "resync failed"),
        }
    }

    /// Follow the store until `shutdown` flips, resyncing every `interval`.
    /// The first resync runs immediately.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.store.watch();
        let mut ticker = tokio::time::interval(interval);
        info!(resync_secs = interval.as_secs(), "trigger loop started");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = self.route(&event) {
                            warn!(kind = event.kind, key = %event.key, error = %e, "failed to route change");
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "change feed lagged, resyncing");
                        self.resync_logged();
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => self.resync_logged(),
                _ = shutdown.changed() => break,
            }
        }
        info!("trigger loop stopped");
    }
}

/// Owns the deployment and release controllers, the trigger loop and the
/// horizontal scaler.
pub struct Manager {
    store: ObjectStore,
    settings: ControllerSection,
}

impl Manager {
    pub fn new(store: ObjectStore, settings: ControllerSection) -> Self {
        Self { store, settings }
    }

    /// Run everything until `shutdown` flips, then wait for each loop to
    /// stop.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let controller_config = self.settings.controller_config();
        let deployments = Controller::new(
            DeploymentReconciler::new(self.store.clone()),
            controller_config.clone(),
        );
        let releases = Controller::new(ReleaseReconciler::new(self.store.clone()), controller_config);
        let triggers = Triggers::new(self.store.clone(), deployments.queue(), releases.queue());
        let mut scaler = HorizontalScaler::new(self.store.clone());

        let resync = self.settings.resync_interval();
        let autoscale = self.settings.autoscale_interval();
        let handles = [
            ("deployment", tokio::spawn(deployments.run(shutdown.clone()))),
            ("release", tokio::spawn(releases.run(shutdown.clone()))),
            ("triggers", tokio::spawn(triggers.run(resync, shutdown.clone()))),
            (
                "autoscaler",
                tokio::spawn(async move { scaler.run(autoscale, shutdown).await }),
            ),
        ];

        for (name, handle) in handles {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "task ended abnormally");
            }
        }
    }
}
