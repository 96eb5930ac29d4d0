//! Object envelope shared by every persisted kind.
//!
//! An [`Object`] carries metadata, a desired-state `spec` and an
//! observed-state `status`. The two halves are written through separate
//! store calls and each has its own optimistic-concurrency version, so a
//! status writer never conflicts with a spec writer.

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A persisted kind: the spec type names its status type and table.
pub trait ResourceSpec:
    Serialize + DeserializeOwned + Clone + PartialEq + Debug + Send + Sync + 'static
{
    type Status: Serialize
        + DeserializeOwned
        + Clone
        + PartialEq
        + Debug
        + Default
        + Send
        + Sync
        + 'static;

    /// Table name and watch-event kind.
    const KIND: &'static str;
}

/// Identity, labels and version tokens for a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    /// Empty for cluster-scoped objects.
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Key of the object that owns this one, if any.
    #[serde(default)]
    pub owner: Option<String>,
    /// Unix timestamp (seconds). Filled in by the store on create when zero.
    #[serde(default)]
    pub created_at: u64,
    /// Bumped on every spec/label write. Zero until first persisted.
    #[serde(default)]
    pub spec_version: u64,
    /// Bumped on every status write.
    #[serde(default)]
    pub status_version: u64,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    /// Store key: `{namespace}/{name}`, or just `{name}` when cluster-scoped.
    pub fn key(&self) -> String {
        object_key(&self.namespace, &self.name)
    }

    /// Whether the store has accepted this object at least once.
    pub fn is_persisted(&self) -> bool {
        self.spec_version > 0
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn with_labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.labels
            .extend(labels.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }
}

/// Build the composite key for an object.
pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Split a composite key back into `(namespace, name)`.
pub fn split_key(key: &str) -> (&str, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (ns, name),
        None => ("", key),
    }
}

/// A stored object of kind `S`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Object<S: ResourceSpec> {
    pub meta: ObjectMeta,
    pub spec: S,
    #[serde(default)]
    pub status: S::Status,
}

impl<S: ResourceSpec> Object<S> {
    pub fn new(meta: ObjectMeta, spec: S) -> Self {
        Self {
            meta,
            spec,
            status: S::Status::default(),
        }
    }

    pub fn key(&self) -> String {
        self.meta.key()
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }
}

/// Equality-based label query, evaluated against the store's label index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    terms: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key=value`.
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.terms.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn terms(&self) -> impl Iterator<Item = (&str, &str)> {
        self.terms.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}
