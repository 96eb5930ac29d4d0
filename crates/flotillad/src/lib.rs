//! flotillad: the Flotilla control plane daemon.
//!
//! Wires the object store, the deployment and release controllers, the
//! change-driven trigger loop and the horizontal scaler into one process.

pub mod config;
pub mod manager;

use flotilla_state::ObjectStore;
use tracing::info;

pub use config::{DaemonConfig, LogConfig, LogFormat, Overrides, StoreConfig};
pub use manager::{Manager, Triggers};

/// File name of the store inside the data directory.
pub const STORE_FILE: &str = "flotilla.redb";

/// Open the store described by `config`, creating the data directory if
/// needed.
pub fn open_store(config: &StoreConfig) -> anyhow::Result<ObjectStore> {
    if config.in_memory {
        info!("using in-memory object store");
        return Ok(ObjectStore::open_in_memory()?);
    }
    std::fs::create_dir_all(&config.data_dir)?;
    let path = config.data_dir.join(STORE_FILE);
    let store = ObjectStore::open(&path)?;
    info!(path = ?path, "object store opened");
    Ok(store)
}
