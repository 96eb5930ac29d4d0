//! Configuration resolution for a descriptor.
//!
//! App configs are published cluster-wide with the app label. The one
//! without a target label is the base; a config carrying the descriptor's
//! target overrides individual keys. Each shared config the descriptor
//! lists is folded in as a single entry holding its serialized contents.
//! The merged map is materialized once per content hash as a `ConfigMap`
//! in the descriptor's namespace, and releases refer to it by name.

use std::collections::BTreeMap;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use flotilla_state::labels::{self, APP_LABEL, CONFIG_HASH_LABEL, SHARED_CONFIG_LABEL, TARGET_LABEL};
use flotilla_state::*;

use crate::error::RolloutResult;

/// Hex digits of the content hash kept in the config map name.
const CONFIG_NAME_HASH_LEN: usize = 6;

/// Merged key/value configuration plus its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub data: BTreeMap<String, String>,
    pub hash: String,
}

impl ResolvedConfig {
    pub fn from_data(data: BTreeMap<String, String>) -> Self {
        let mut hasher = Sha256::new();
        // BTreeMap iterates in key order. Each field is length-prefixed so
        // entry boundaries cannot shift between keys and values.
        for (key, value) in &data {
            for field in [key, value] {
                hasher.update((field.len() as u64).to_le_bytes());
                hasher.update(field.as_bytes());
            }
        }
        let hash = hex::encode(hasher.finalize());
        Self { data, hash }
    }

    /// `{app}-{hash[..6]}`
    pub fn config_map_name(&self, app: &str) -> String {
        let short = self.hash.get(..CONFIG_NAME_HASH_LEN).unwrap_or(&self.hash);
        format!("{app}-{short}")
    }
}

/// Supplies the merged configuration for a descriptor.
pub trait ConfigSource: Send + Sync {
    /// `None` when the descriptor has neither an app config nor any
    /// resolvable shared config.
    fn resolve(&self, at: &AppTarget) -> RolloutResult<Option<ResolvedConfig>>;
}

/// Resolves configuration from `AppConfig` objects in the store.
#[derive(Clone)]
pub struct StoreConfigSource {
    store: ObjectStore,
}

impl StoreConfigSource {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    /// Base config overlaid with the target-specific one, from every
    /// config of `config_type` matching `selector`.
    fn merged(
        &self,
        config_type: ConfigType,
        selector: &LabelSelector,
        target: &str,
    ) -> RolloutResult<Option<BTreeMap<String, String>>> {
        let configs: Vec<AppConfig> = self
            .store
            .list_matching::<AppConfigSpec>(selector)?
            .into_iter()
            .filter(|c| c.spec.config_type == config_type)
            .collect();

        let base = configs
            .iter()
            .find(|c| c.meta.label(TARGET_LABEL).is_none_or(str::is_empty));
        let scoped = configs
            .iter()
            .find(|c| c.meta.label(TARGET_LABEL) == Some(target));

        let mut entries = match (base, scoped) {
            (None, None) => return Ok(None),
            (Some(base), _) => base.spec.entries.clone(),
            (None, Some(_)) => BTreeMap::new(),
        };
        if let Some(scoped) = scoped {
            entries.extend(scoped.spec.entries.clone());
        }
        Ok(Some(entries))
    }
}

impl ConfigSource for StoreConfigSource {
    fn resolve(&self, at: &AppTarget) -> RolloutResult<Option<ResolvedConfig>> {
        let valid_key = Regex::new(r"^[A-Z_][A-Z0-9_]*$")?;
        let app_config = self.merged(
            ConfigType::App,
            &LabelSelector::new().with(APP_LABEL, &at.spec.app),
            &at.spec.target,
        )?;

        let mut shared = Vec::new();
        for name in &at.spec.configs {
            let selector = LabelSelector::new().with(SHARED_CONFIG_LABEL, name);
            match self.merged(ConfigType::Shared, &selector, &at.spec.target)? {
                Some(entries) => shared.push((name, entries)),
                None => warn!(app = %at.spec.app, target = %at.spec.target, config = %name, "could not find shared config"),
            }
        }

        if app_config.is_none() && shared.is_empty() {
            return Ok(None);
        }

        let mut data = BTreeMap::new();
        for (key, value) in app_config.unwrap_or_default() {
            let env_key = EnvVar::normalize_name(&key);
            if valid_key.is_match(&env_key) {
                data.insert(env_key, value);
            } else {
                warn!(app = %at.spec.app, %key, "skipping config key that is not a valid environment name");
            }
        }
        for (name, entries) in shared {
            data.insert(EnvVar::normalize_name(name), serde_json::to_string(&entries)?);
        }
        Ok(Some(ResolvedConfig::from_data(data)))
    }
}

/// Create the config map for `config` in the descriptor's namespace unless
/// one with that content already exists. Returns its name.
pub fn ensure_config_map(store: &ObjectStore, at: &AppTarget, config: &ResolvedConfig) -> RolloutResult<String> {
    let name = config.config_map_name(&at.spec.app);
    let namespace = at.target_namespace();
    if store.get::<ConfigMapSpec>(namespace, &name)?.is_some() {
        debug!(%name, "config map already present");
        return Ok(name);
    }

    let mut meta = ObjectMeta::new(namespace, &name);
    meta.labels = labels::target_labels(&at.spec.app, &at.spec.target);
    meta.labels
        .insert(CONFIG_HASH_LABEL.to_string(), config.hash.clone());
    meta.owner = Some(at.key());

    match store.create(Object::new(meta, ConfigMapSpec { data: config.data.clone() })) {
        Ok(_) => {
            info!(app = %at.spec.app, target = %at.spec.target, %name, "created config map");
            Ok(name)
        }
        // Same content hash means same data.
        Err(StateError::AlreadyExists { .. }) => Ok(name),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_target(configs: &[&str]) -> AppTarget {
        Object::new(
            ObjectMeta::new("", "web-prod"),
            AppTargetSpec {
                app: "web".to_string(),
                target: "prod".to_string(),
                build: "web-v1-abcd".to_string(),
                deploy_mode: DeployMode::Latest,
                runtime: RuntimeSpec::default(),
                configs: configs.iter().map(|c| c.to_string()).collect(),
                scale: ScaleSpec::default(),
                ingress: None,
            },
        )
    }

    fn app_config(name: &str, target: Option<&str>, entries: &[(&str, &str)]) -> AppConfig {
        let mut meta = ObjectMeta::new("", name).with_labels([(APP_LABEL, "web")]);
        if let Some(target) = target {
            meta.labels.insert(TARGET_LABEL.to_string(), target.to_string());
        }
        Object::new(
            meta,
            AppConfigSpec {
                config_type: ConfigType::App,
                entries: entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        )
    }

    fn shared_config(name: &str, entries: &[(&str, &str)]) -> AppConfig {
        Object::new(
            ObjectMeta::new("", name).with_labels([(SHARED_CONFIG_LABEL, name)]),
            AppConfigSpec {
                config_type: ConfigType::Shared,
                entries: entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        )
    }

    #[test]
    fn no_config_resolves_to_none() {
        let store = ObjectStore::open_in_memory().unwrap();
        let source = StoreConfigSource::new(store);
        assert_eq!(source.resolve(&app_target(&["missing"])).unwrap(), None);
    }

    #[test]
    fn target_config_overrides_base() {
        let store = ObjectStore::open_in_memory().unwrap();
        store
            .create(app_config("web", None, &[("log-level", "info"), ("port", "80")]))
            .unwrap();
        store
            .create(app_config("web-prod", Some("prod"), &[("log-level", "warn")]))
            .unwrap();
        store
            .create(app_config("web-dev", Some("dev"), &[("log-level", "debug")]))
            .unwrap();

        let resolved = StoreConfigSource::new(store)
            .resolve(&app_target(&[]))
            .unwrap()
            .unwrap();

        assert_eq!(resolved.data.get("LOG_LEVEL").map(String::as_str), Some("warn"));
        assert_eq!(resolved.data.get("PORT").map(String::as_str), Some("80"));
        assert_eq!(resolved.data.len(), 2);
    }

    #[test]
    fn shared_configs_become_single_entries() {
        let store = ObjectStore::open_in_memory().unwrap();
        store
            .create(shared_config("db-main", &[("host", "db.internal")]))
            .unwrap();

        let resolved = StoreConfigSource::new(store)
            .resolve(&app_target(&["db-main"]))
            .unwrap()
            .unwrap();

        assert_eq!(
            resolved.data.get("DB_MAIN").map(String::as_str),
            Some(r#"{"host":"db.internal"}"#)
        );
    }

    #[test]
    fn invalid_keys_are_skipped() {
        let store = ObjectStore::open_in_memory().unwrap();
        store
            .create(app_config("web", None, &[("9lives", "x"), ("ok", "y")]))
            .unwrap();

        let resolved = StoreConfigSource::new(store)
            .resolve(&app_target(&[]))
            .unwrap()
            .unwrap();
        assert_eq!(resolved.data.keys().collect::<Vec<_>>(), vec!["OK"]);
    }

    #[test]
    fn hash_follows_content() {
        let a = ResolvedConfig::from_data(BTreeMap::from([("A".to_string(), "1".to_string())]));
        let b = ResolvedConfig::from_data(BTreeMap::from([("A".to_string(), "1".to_string())]));
        let c = ResolvedConfig::from_data(BTreeMap::from([("A".to_string(), "2".to_string())]));
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
        assert_eq!(a.config_map_name("web").len(), "web-".len() + 6);
    }

    #[test]
    fn hash_separates_keys_from_values() {
        let split = ResolvedConfig::from_data(BTreeMap::from([
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "2".to_string()),
        ]));
        let joined = ResolvedConfig::from_data(BTreeMap::from([("A".to_string(), "1B=2".to_string())]));
        assert_ne!(split.hash, joined.hash);

        let key_heavy = ResolvedConfig::from_data(BTreeMap::from([("AB".to_string(), "".to_string())]));
        let value_heavy = ResolvedConfig::from_data(BTreeMap::from([("A".to_string(), "B".to_string())]));
        assert_ne!(key_heavy.hash, value_heavy.hash);
    }

    #[test]
    fn config_map_is_created_once() {
        let store = ObjectStore::open_in_memory().unwrap();
        let at = app_target(&[]);
        let config = ResolvedConfig::from_data(BTreeMap::from([("A".to_string(), "1".to_string())]));

        let name = ensure_config_map(&store, &at, &config).unwrap();
        assert_eq!(ensure_config_map(&store, &at, &config).unwrap(), name);

        let map = store.get::<ConfigMapSpec>("prod", &name).unwrap().unwrap();
        assert_eq!(map.spec.data, config.data);
        assert_eq!(map.meta.label(CONFIG_HASH_LABEL), Some(config.hash.as_str()));
        assert_eq!(map.meta.spec_version, 1);
    }
}
