//! ObjectStore: redb-backed object persistence for Flotilla.
//!
//! Every kind lives in its own table of JSON-serialized [`Object`]s. Labels
//! are mirrored into a secondary index so selector queries avoid full scans.
//! Spec and status are versioned independently: a write carrying a stale
//! version fails with [`StateError::Conflict`] instead of clobbering a
//! concurrent writer. Committed changes are published on a broadcast
//! channel for controllers to react to.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::meta::{LabelSelector, Object, ResourceSpec, object_key};
use crate::retry::{DEFAULT_CONFLICT_ATTEMPTS, retry_on_conflict};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Capacity of the change-event channel. Slow subscribers see `Lagged`.
const WATCH_CAPACITY: usize = 1024;

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Created,
    SpecUpdated,
    StatusUpdated,
    Deleted,
}

/// A committed change to one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: &'static str,
    pub key: String,
    pub labels: BTreeMap<String, String>,
    pub owner: Option<String>,
    pub change: Change,
}

/// Thread-safe object store backed by redb.
#[derive(Clone)]
pub struct ObjectStore {
    db: Arc<Database>,
    events: broadcast::Sender<WatchEvent>,
}

fn decode<S: ResourceSpec>(bytes: &[u8]) -> StateResult<Object<S>> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn encode<S: ResourceSpec>(obj: &Object<S>) -> StateResult<Vec<u8>> {
    serde_json::to_vec(obj).map_err(map_err!(Serialize))
}

impl ObjectStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "object store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory object store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            db: Arc::new(db),
            events,
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(objects::<AppTargetSpec>()).map_err(map_err!(Table))?;
        txn.open_table(objects::<BuildSpec>()).map_err(map_err!(Table))?;
        txn.open_table(objects::<AppReleaseSpec>()).map_err(map_err!(Table))?;
        txn.open_table(objects::<ReplicaGroupSpec>()).map_err(map_err!(Table))?;
        txn.open_table(objects::<InstanceSpec>()).map_err(map_err!(Table))?;
        txn.open_table(objects::<AutoscalerSpec>()).map_err(map_err!(Table))?;
        txn.open_table(objects::<AppConfigSpec>()).map_err(map_err!(Table))?;
        txn.open_table(objects::<ConfigMapSpec>()).map_err(map_err!(Table))?;
        txn.open_table(objects::<TrafficSplitSpec>()).map_err(map_err!(Table))?;
        txn.open_table(LABEL_INDEX).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Subscribe to committed changes across all kinds.
    pub fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    fn publish<S: ResourceSpec>(&self, obj: &Object<S>, change: Change) {
        // No subscribers is not an error.
        let _ = self.events.send(WatchEvent {
            kind: S::KIND,
            key: obj.key(),
            labels: obj.meta.labels.clone(),
            owner: obj.meta.owner.clone(),
            change,
        });
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get an object by namespace and name.
    pub fn get<S: ResourceSpec>(&self, namespace: &str, name: &str) -> StateResult<Option<Object<S>>> {
        self.get_by_key(&object_key(namespace, name))
    }

    /// Get an object by its composite key.
    pub fn get_by_key<S: ResourceSpec>(&self, key: &str) -> StateResult<Option<Object<S>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(objects::<S>()).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List every object of a kind.
    pub fn list<S: ResourceSpec>(&self) -> StateResult<Vec<Object<S>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(objects::<S>()).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// List objects whose labels satisfy every term of `selector`.
    pub fn list_matching<S: ResourceSpec>(
        &self,
        selector: &LabelSelector,
    ) -> StateResult<Vec<Object<S>>> {
        let Some((label, value)) = selector.terms().next() else {
            return self.list();
        };

        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn.open_table(LABEL_INDEX).map_err(map_err!(Table))?;
        let prefix = index_prefix(S::KIND, label, value);
        let mut keys = Vec::new();
        for entry in index.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (k, _) = entry.map_err(map_err!(Read))?;
            let Some(object_key) = k.value().strip_prefix(prefix.as_str()) else {
                break;
            };
            keys.push(object_key.to_string());
        }

        let table = txn.open_table(objects::<S>()).map_err(map_err!(Table))?;
        let mut results = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(guard) = table.get(key.as_str()).map_err(map_err!(Read))? {
                let obj: Object<S> = decode(guard.value())?;
                if selector.matches(&obj.meta.labels) {
                    results.push(obj);
                }
            }
        }
        Ok(results)
    }

    // ── Writes ─────────────────────────────────────────────────────

    fn load_for_write<S: ResourceSpec>(
        txn: &WriteTransaction,
        key: &str,
    ) -> StateResult<Option<Object<S>>> {
        let table = txn.open_table(objects::<S>()).map_err(map_err!(Table))?;
        let current = match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        };
        Ok(current)
    }

    fn store_object<S: ResourceSpec>(txn: &WriteTransaction, obj: &Object<S>) -> StateResult<()> {
        let key = obj.key();
        let value = encode(obj)?;
        let mut table = txn.open_table(objects::<S>()).map_err(map_err!(Table))?;
        table
            .insert(key.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    fn reindex<S: ResourceSpec>(
        txn: &WriteTransaction,
        key: &str,
        old: &BTreeMap<String, String>,
        new: &BTreeMap<String, String>,
    ) -> StateResult<()> {
        let mut index = txn.open_table(LABEL_INDEX).map_err(map_err!(Table))?;
        for (label, value) in old {
            if new.get(label) != Some(value) {
                let k = index_key(S::KIND, label, value, key);
                index.remove(k.as_str()).map_err(map_err!(Write))?;
            }
        }
        for (label, value) in new {
            if old.get(label) != Some(value) {
                let k = index_key(S::KIND, label, value, key);
                index.insert(k.as_str(), ()).map_err(map_err!(Write))?;
            }
        }
        Ok(())
    }

    /// Persist a new object. Fails with `AlreadyExists` if the key is taken.
    pub fn create<S: ResourceSpec>(&self, obj: Object<S>) -> StateResult<Object<S>> {
        let mut obj = obj;
        let key = obj.key();
        if obj.meta.created_at == 0 {
            obj.meta.created_at = epoch_secs();
        }
        obj.meta.spec_version = 1;
        obj.meta.status_version = 1;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        if Self::load_for_write::<S>(&txn, &key)?.is_some() {
            return Err(StateError::AlreadyExists { kind: S::KIND, key });
        }
        Self::store_object(&txn, &obj)?;
        Self::reindex::<S>(&txn, &key, &BTreeMap::new(), &obj.meta.labels)?;
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(kind = S::KIND, %key, "object created");
        self.publish(&obj, Change::Created);
        Ok(obj)
    }

    /// Replace spec, labels and owner. `obj.meta.spec_version` must match the
    /// stored version. The stored status is kept as-is.
    pub fn update_spec<S: ResourceSpec>(&self, obj: &Object<S>) -> StateResult<Object<S>> {
        let key = obj.key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let current = Self::load_for_write::<S>(&txn, &key)?
            .ok_or_else(|| StateError::NotFound(format!("{} {key}", S::KIND)))?;
        if current.meta.spec_version != obj.meta.spec_version {
            return Err(StateError::Conflict {
                kind: S::KIND,
                key,
                observed: obj.meta.spec_version,
                stored: current.meta.spec_version,
            });
        }

        let mut updated = current.clone();
        updated.spec = obj.spec.clone();
        updated.meta.labels = obj.meta.labels.clone();
        updated.meta.owner = obj.meta.owner.clone();
        updated.meta.spec_version += 1;

        Self::store_object(&txn, &updated)?;
        Self::reindex::<S>(&txn, &key, &current.meta.labels, &updated.meta.labels)?;
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(kind = S::KIND, %key, version = updated.meta.spec_version, "spec updated");
        self.publish(&updated, Change::SpecUpdated);
        Ok(updated)
    }

    /// Replace the status. `obj.meta.status_version` must match the stored
    /// version. Spec and labels are not touched.
    pub fn update_status<S: ResourceSpec>(&self, obj: &Object<S>) -> StateResult<Object<S>> {
        let key = obj.key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let current = Self::load_for_write::<S>(&txn, &key)?
            .ok_or_else(|| StateError::NotFound(format!("{} {key}", S::KIND)))?;
        if current.meta.status_version != obj.meta.status_version {
            return Err(StateError::Conflict {
                kind: S::KIND,
                key,
                observed: obj.meta.status_version,
                stored: current.meta.status_version,
            });
        }

        let mut updated = current;
        updated.status = obj.status.clone();
        updated.meta.status_version += 1;

        Self::store_object(&txn, &updated)?;
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(kind = S::KIND, %key, version = updated.meta.status_version, "status updated");
        self.publish(&updated, Change::StatusUpdated);
        Ok(updated)
    }

    /// Delete an object by namespace and name. Returns true if it existed.
    pub fn delete<S: ResourceSpec>(&self, namespace: &str, name: &str) -> StateResult<bool> {
        let key = object_key(namespace, name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let Some(current) = Self::load_for_write::<S>(&txn, &key)? else {
            return Ok(false);
        };
        {
            let mut table = txn.open_table(objects::<S>()).map_err(map_err!(Table))?;
            table.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        Self::reindex::<S>(&txn, &key, &current.meta.labels, &BTreeMap::new())?;
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(kind = S::KIND, %key, "object deleted");
        self.publish(&current, Change::Deleted);
        Ok(true)
    }

    // ── Convenience ────────────────────────────────────────────────

    /// Create `desired`, or bring the stored object's spec, labels and owner
    /// in line with it. Skips the write when nothing differs. Intended for
    /// derived objects that have a single writer.
    pub fn apply<S: ResourceSpec>(&self, desired: Object<S>) -> StateResult<(Object<S>, bool)> {
        retry_on_conflict(DEFAULT_CONFLICT_ATTEMPTS, || {
            let Some(current) = self.get_by_key::<S>(&desired.key())? else {
                return match self.create(desired.clone()) {
                    Ok(created) => Ok((created, true)),
                    // Lost a create race; treat like a conflict and re-read.
                    Err(StateError::AlreadyExists { kind, key }) => Err(StateError::Conflict {
                        kind,
                        key,
                        observed: 0,
                        stored: 1,
                    }),
                    Err(e) => Err(e),
                };
            };
            if current.spec == desired.spec
                && current.meta.labels == desired.meta.labels
                && current.meta.owner == desired.meta.owner
            {
                return Ok((current, false));
            }
            let mut next = current;
            next.spec = desired.spec.clone();
            next.meta.labels = desired.meta.labels.clone();
            next.meta.owner = desired.meta.owner.clone();
            Ok((self.update_spec(&next)?, true))
        })
    }

    /// Read the object, let `f` edit its status, and write it back only if
    /// the status changed. Conflicts are retried against a fresh read.
    /// Returns `None` when the object does not exist.
    pub fn modify_status<S, F>(
        &self,
        namespace: &str,
        name: &str,
        mut f: F,
    ) -> StateResult<Option<Object<S>>>
    where
        S: ResourceSpec,
        F: FnMut(&Object<S>, &mut S::Status),
    {
        retry_on_conflict(DEFAULT_CONFLICT_ATTEMPTS, || {
            let Some(mut obj) = self.get::<S>(namespace, name)? else {
                return Ok(None);
            };
            let mut status = obj.status.clone();
            f(&obj, &mut status);
            if status == obj.status {
                return Ok(Some(obj));
            }
            obj.status = status;
            self.update_status(&obj).map(Some)
        })
    }

    /// Like [`modify_status`](Self::modify_status), for spec, labels and owner.
    pub fn modify_spec<S, F>(
        &self,
        namespace: &str,
        name: &str,
        mut f: F,
    ) -> StateResult<Option<Object<S>>>
    where
        S: ResourceSpec,
        F: FnMut(&mut Object<S>),
    {
        retry_on_conflict(DEFAULT_CONFLICT_ATTEMPTS, || {
            let Some(current) = self.get::<S>(namespace, name)? else {
                return Ok(None);
            };
            let mut edited = current.clone();
            f(&mut edited);
            if edited.spec == current.spec
                && edited.meta.labels == current.meta.labels
                && edited.meta.owner == current.meta.owner
            {
                return Ok(Some(current));
            }
            edited.meta.spec_version = current.meta.spec_version;
            self.update_spec(&edited).map(Some)
        })
    }
}
