//! redb table definitions for the Flotilla object store.
//!
//! Every object kind gets its own table named after `ResourceSpec::KIND`,
//! with `&str` keys (`{namespace}/{name}` or bare `{name}` for cluster-scoped
//! objects) and `&[u8]` values (JSON-serialized `Object<S>`).

use redb::TableDefinition;

use crate::meta::ResourceSpec;

/// Secondary label index keyed by `{kind}\x1f{label}={value}\x1f{object_key}`.
pub const LABEL_INDEX: TableDefinition<&str, ()> = TableDefinition::new("label_index");

/// Separator between the segments of a label index key.
pub(crate) const INDEX_SEP: char = '\x1f';

/// Table holding every object of kind `S`.
pub fn objects<S: ResourceSpec>() -> TableDefinition<'static, &'static str, &'static [u8]> {
    TableDefinition::new(S::KIND)
}

/// Index key prefix covering all objects of `kind` carrying `label=value`.
pub(crate) fn index_prefix(kind: &str, label: &str, value: &str) -> String {
    format!("{kind}{INDEX_SEP}{label}={value}{INDEX_SEP}")
}

/// Full index key for one object.
pub(crate) fn index_key(kind: &str, label: &str, value: &str, object_key: &str) -> String {
    format!("{}{object_key}", index_prefix(kind, label, value))
}
