//! Domain types persisted in the object store.
//!
//! Deployment descriptors (`AppTarget`), release records (`AppRelease`) and
//! builds are owned by the control plane. Replica groups, instances and
//! autoscalers model the workload runtime this control plane drives. Config
//! objects come from the configuration service and are only read here.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::meta::{Object, ResourceSpec};

// ── Runtime spec shared by descriptors and releases ───────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Quantities use the usual suffix notation (`"250m"`, `"512Mi"`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: ResourceList,
    #[serde(default)]
    pub limits: ResourceList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeHandler {
    Exec { command: Vec<String> },
    HttpGet { path: String, port: String },
    TcpSocket { port: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub handler: ProbeHandler,
    #[serde(default)]
    pub initial_delay_secs: u32,
    #[serde(default)]
    pub timeout_secs: u32,
    #[serde(default)]
    pub period_secs: u32,
    #[serde(default)]
    pub success_threshold: u32,
    #[serde(default)]
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<Probe>,
}

/// Used when no readiness probe says otherwise.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(60);

impl ProbeConfig {
    /// How long an instance is given to become ready. Doubles as the ramp
    /// cadence and the drain grace period.
    pub fn readiness_timeout(&self) -> Duration {
        match &self.readiness {
            Some(p) if p.initial_delay_secs > 0 => {
                Duration::from_secs(p.initial_delay_secs as u64)
            }
            Some(p) if p.period_secs > 0 => {
                Duration::from_secs((p.period_secs + p.timeout_secs) as u64)
            }
            _ => DEFAULT_READINESS_TIMEOUT,
        }
    }
}

/// Another application this one talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppReference {
    pub name: String,
    /// Defaults to the referencing app's own target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Restrict to a single named port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

/// Everything that shapes the running container. Copied from the descriptor
/// into each release when the release is cut.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuntimeSpec {
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<AppReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub probes: ProbeConfig,
}

// ── Deployment descriptor ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployMode {
    #[default]
    Latest,
    Halt,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScaleSpec {
    #[serde(default)]
    pub min: u32,
    #[serde(default)]
    pub max: u32,
    /// Average CPU utilization (percent) the autoscaler aims for. Zero disables it.
    #[serde(default)]
    pub target_cpu_utilization: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IngressConfig {
    pub hosts: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default)]
    pub require_https: bool,
}

/// Desired state of one application in one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppTargetSpec {
    pub app: String,
    pub target: String,
    /// Name of the `Build` to run.
    pub build: String,
    #[serde(default)]
    pub deploy_mode: DeployMode,
    #[serde(default)]
    pub runtime: RuntimeSpec,
    /// Shared configs merged into the app's own config.
    #[serde(default)]
    pub configs: Vec<String>,
    #[serde(default)]
    pub scale: ScaleSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppTargetPhase {
    #[default]
    Running,
    Deploying,
    Halted,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppTargetStatus {
    #[serde(default)]
    pub phase: AppTargetPhase,
    #[serde(default)]
    pub target_release: String,
    #[serde(default)]
    pub active_release: String,
    /// Unix timestamp of the last traffic/role change.
    #[serde(default)]
    pub deploy_updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scaled_at: Option<u64>,
    #[serde(default)]
    pub num_desired: u32,
    #[serde(default)]
    pub num_ready: u32,
    #[serde(default)]
    pub num_available: u32,
}

impl ResourceSpec for AppTargetSpec {
    type Status = AppTargetStatus;
    const KIND: &'static str = "apptargets";
}

pub type AppTarget = Object<AppTargetSpec>;

impl Object<AppTargetSpec> {
    /// Conventional descriptor name: `{app}-{target}`.
    pub fn scoped_name(app: &str, target: &str) -> String {
        format!("{app}-{target}")
    }

    /// Namespace holding everything this descriptor owns.
    pub fn target_namespace(&self) -> &str {
        &self.spec.target
    }

    /// Instance count the rollout should converge on. Follows the count
    /// mirrored from the active release so autoscaler decisions stick.
    pub fn desired_instances(&self) -> u32 {
        if self.spec.deploy_mode == DeployMode::Halt {
            return 0;
        }
        let max = self.spec.scale.max.max(self.spec.scale.min);
        self.spec.scale.min.max(self.status.num_desired).min(max)
    }

    pub fn needs_service(&self) -> bool {
        !self.spec.runtime.ports.is_empty()
    }

    pub fn needs_autoscaler(&self) -> bool {
        self.spec.runtime.resources.requests.cpu.is_some()
            && self.spec.scale.target_cpu_utilization > 0
            && self.spec.scale.min != self.spec.scale.max
    }

    pub fn readiness_timeout(&self) -> Duration {
        self.spec.runtime.probes.readiness_timeout()
    }
}

// ── Build ─────────────────────────────────────────────────────────

/// Immutable reference to a container image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    #[serde(default)]
    pub registry: String,
    pub image: String,
    #[serde(default)]
    pub tag: String,
    /// Unix timestamp the image was produced.
    pub created_at: u64,
}

impl ResourceSpec for BuildSpec {
    type Status = ();
    const KIND: &'static str = "builds";
}

pub type Build = Object<BuildSpec>;

impl BuildSpec {
    pub fn image_path(&self) -> String {
        if self.registry.is_empty() {
            self.image.clone()
        } else {
            format!("{}/{}", self.registry, self.image)
        }
    }

    pub fn full_image_with_tag(&self) -> String {
        let image = self.image_path();
        if self.tag.is_empty() {
            image
        } else {
            format!("{image}:{}", self.tag)
        }
    }

    /// Content-derived name: sanitized `image-tag` plus a short digest of
    /// the fully qualified reference.
    pub fn unique_name(&self) -> String {
        let digest = Sha256::digest(format!(
            "{}:{}",
            self.registry,
            self.full_image_with_tag()
        ));
        let short = &hex::encode(digest)[..4];

        let mut name = self.image.clone();
        if !self.tag.is_empty() {
            name.push('-');
            name.push_str(&self.tag);
        }
        let name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        format!("{name}-{short}")
    }
}

// ── Release record ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseRole {
    #[default]
    None,
    Active,
    Target,
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseState {
    #[default]
    New,
    Canarying,
    Releasing,
    Released,
    Retiring,
    Retired,
    Failed,
    Bad,
    Halted,
}

/// One (build, configuration) instantiation of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppReleaseSpec {
    pub app: String,
    pub target: String,
    pub build: String,
    /// Name of the materialized config map; empty when the app has no config.
    #[serde(default)]
    pub config: String,
    #[serde(default)]
    pub num_desired: u32,
    #[serde(default)]
    pub role: ReleaseRole,
    #[serde(default)]
    pub traffic_percentage: u32,
    #[serde(default)]
    pub runtime: RuntimeSpec,
}

/// Why one instance is not healthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodError {
    pub pod: String,
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppReleaseStatus {
    #[serde(default)]
    pub state: ReleaseState,
    #[serde(default)]
    pub state_changed_at: u64,
    #[serde(default)]
    pub num_desired: u32,
    #[serde(default)]
    pub num_ready: u32,
    #[serde(default)]
    pub num_available: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_errors: Vec<PodError>,
}

impl ResourceSpec for AppReleaseSpec {
    type Status = AppReleaseStatus;
    const KIND: &'static str = "appreleases";
}

pub type AppRelease = Object<AppReleaseSpec>;

// ── Workload runtime ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    /// Environment-style name: upper case, `-` and `.` become `_`.
    pub fn normalize_name(name: &str) -> String {
        name.to_uppercase().replace(['-', '.'], "_")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_probe: Option<Probe>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,
}

/// A set of identical instances backing one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaGroupSpec {
    pub replicas: u32,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    pub template: PodTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicaGroupStatus {
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub ready_replicas: u32,
    #[serde(default)]
    pub available_replicas: u32,
}

impl ResourceSpec for ReplicaGroupSpec {
    type Status = ReplicaGroupStatus;
    const KIND: &'static str = "replicagroups";
}

pub type ReplicaGroup = Object<ReplicaGroupSpec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceCondition {
    pub kind: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terminated {
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContainerState {
    #[default]
    Running,
    Waiting {
        #[serde(default)]
        reason: String,
        #[serde(default)]
        message: String,
    },
    Terminated(Terminated),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub state: ContainerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_termination: Option<Terminated>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceStatus {
    #[serde(default)]
    pub phase: InstancePhase,
    #[serde(default)]
    pub conditions: Vec<InstanceCondition>,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
    /// Average CPU use as a percentage of the requested CPU, as last sampled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_utilization: Option<u32>,
}

impl ResourceSpec for InstanceSpec {
    type Status = InstanceStatus;
    const KIND: &'static str = "instances";
}

/// One running copy of a replica group's template.
pub type Instance = Object<InstanceSpec>;

/// Horizontal autoscaler bound to one release's replica group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalerSpec {
    /// Release (and replica group) whose instance count it manages.
    pub release: String,
    pub min_replicas: u32,
    pub max_replicas: u32,
    #[serde(default)]
    pub target_cpu_utilization: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AutoscalerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_time: Option<u64>,
    #[serde(default)]
    pub current_replicas: u32,
    #[serde(default)]
    pub desired_replicas: u32,
}

impl ResourceSpec for AutoscalerSpec {
    type Status = AutoscalerStatus;
    const KIND: &'static str = "autoscalers";
}

pub type Autoscaler = Object<AutoscalerSpec>;

// ── Configuration ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigType {
    #[default]
    App,
    Shared,
}

/// Key/value configuration published by the configuration service. App
/// configs carry the app label; a target label narrows them to one target.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppConfigSpec {
    #[serde(default)]
    pub config_type: ConfigType,
    #[serde(default)]
    pub entries: BTreeMap<String, String>,
}

impl ResourceSpec for AppConfigSpec {
    type Status = ();
    const KIND: &'static str = "appconfigs";
}

pub type AppConfig = Object<AppConfigSpec>;

/// Materialized, merged configuration a release points at.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfigMapSpec {
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl ResourceSpec for ConfigMapSpec {
    type Status = ();
    const KIND: &'static str = "configmaps";
}

pub type ConfigMap = Object<ConfigMapSpec>;

// ── Routing ───────────────────────────────────────────────────────

/// One weighted backend for the routing generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedRoute {
    pub release: String,
    pub role: ReleaseRole,
    pub weight: u32,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
}

/// Traffic-weighted release list consumed by the mesh configuration generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSplitSpec {
    pub app: String,
    pub target: String,
    #[serde(default)]
    pub routes: Vec<WeightedRoute>,
}

impl ResourceSpec for TrafficSplitSpec {
    type Status = ();
    const KIND: &'static str = "trafficsplits";
}

pub type TrafficSplit = Object<TrafficSplitSpec>;
