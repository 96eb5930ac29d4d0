//! flotilla-state: embedded object store for Flotilla.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for deployment descriptors, releases, builds and the workload
//! objects the control plane derives from them.
//!
//! # Architecture
//!
//! Every kind is an [`Object`] with metadata, a spec and a status, stored as
//! JSON in a per-kind table keyed by `{namespace}/{name}`. A label index
//! backs selector queries. Spec and status carry separate versions so
//! concurrent writers fail with a conflict instead of losing updates.
//!
//! The `ObjectStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks and blocking workers.

pub mod error;
pub mod labels;
pub mod meta;
pub mod retry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use meta::{LabelSelector, Object, ObjectMeta, ResourceSpec, object_key, split_key};
pub use retry::retry_on_conflict;
pub use store::{Change, ObjectStore, WatchEvent, epoch_secs};
pub use types::*;
