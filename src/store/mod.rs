//! Versioned key-value store binding.
//!
//! Every record carries an opaque version index. Writers pass the index they
//! last read; the store accepts the write only if it still matches, otherwise
//! it reports [`StoreError::KeyModified`] and the writer must re-read.
//!
//! ## Keys
//!
//! ```text
//! ipam/default/config/<address space>   # pool database of one address space
//! ipam/default/data/<pool id>           # bitmap of one root pool
//! ```

pub mod file;
pub mod memory;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Namespace of address-space records
pub const DS_CONFIG_KEY: &str = "ipam/default/config";
/// Namespace of bitmap records
pub const DS_DATA_KEY: &str = "ipam/default/data";

/// Errors reported by a store backend
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found in store")]
    KeyNotFound,

    #[error("key modified since last read")]
    KeyModified,

    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode or decode store record: {0}")]
    Codec(String),
}

/// Visibility of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Local,
    Global,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Local => write!(f, "local"),
            Scope::Global => write!(f, "global"),
        }
    }
}

/// A stored value and the version index it was written at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    pub value: Vec<u8>,
    pub index: u64,
}

/// Compare-and-swap key-value store shared by cooperating allocators
pub trait DataStore: Send + Sync + fmt::Debug {
    fn scope(&self) -> Scope;

    fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError>;

    /// Write `value` if the key is still at `previous`; `None` means the key must not exist yet.
    /// Returns the new index.
    fn put_atomic(&self, key: &str, value: &[u8], previous: Option<u64>) -> Result<u64, StoreError>;

    /// Delete the key if it is still at `previous`.
    fn delete_atomic(&self, key: &str, previous: u64) -> Result<(), StoreError>;
}

/// Backend selection, as it appears in configuration files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    File { path: PathBuf },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory
    }
}

/// Payload of a store-configuration discovery notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastoreConfigData {
    pub scope: Scope,
    pub config: StoreConfig,
}

/// Open the store described by `data`.
pub fn new_store(data: &DatastoreConfigData) -> Result<Arc<dyn DataStore>, StoreError> {
    match &data.config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new(data.scope))),
        StoreConfig::File { path } => Ok(Arc::new(FileStore::open(path, data.scope)?)),
    }
}

pub(crate) fn config_key(address_space: &str) -> String {
    format!("{}/{}", DS_CONFIG_KEY, address_space)
}

pub(crate) fn data_key(id: &str) -> String {
    format!("{}/{}", DS_DATA_KEY, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        assert_eq!(config_key("LocalDefault"), "ipam/default/config/LocalDefault");
        assert_eq!(data_key("LocalDefault/10.0.0.0/24"), "ipam/default/data/LocalDefault/10.0.0.0/24");
    }

    #[test]
    fn test_store_config_yaml() {
        let cfg: StoreConfig = serde_yaml::from_str("backend: file\npath: /var/lib/netpool\n").unwrap();
        assert_eq!(cfg, StoreConfig::File { path: PathBuf::from("/var/lib/netpool") });
        let cfg: StoreConfig = serde_yaml::from_str("backend: memory\n").unwrap();
        assert_eq!(cfg, StoreConfig::Memory);
    }

    #[test]
    fn test_new_store_memory() {
        let store = new_store(&DatastoreConfigData { scope: Scope::Global, config: StoreConfig::Memory }).unwrap();
        assert_eq!(store.scope(), Scope::Global);
        assert!(store.get("missing").unwrap().is_none());
    }
}
