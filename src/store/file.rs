//! Directory-backed store.
//!
//! Each key is one `bincode`-encoded entry file; a counter file hands out
//! monotonically increasing version indexes. Writes go through a temporary
//! file and a rename. Compare-and-swap is serialized by a lock held by this
//! handle, so a directory must be shared through clones of one `FileStore`,
//! not by separate processes.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{DataStore, KvPair, Scope, StoreError};

const INDEX_FILE: &str = "index.bin";
const ENTRY_DIR: &str = "entries";

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    scope: Scope,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    index: u64,
    value: Vec<u8>,
}

/// Map a store key onto a flat file name
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn codec_err(e: bincode::Error) -> StoreError {
    StoreError::Codec(e.to_string())
}

impl FileStore {
    pub fn open(root: &Path, scope: Scope) -> Result<Self, StoreError> {
        fs::create_dir_all(root.join(ENTRY_DIR))?;
        log::info!("Opened {} file store at {:?}", scope, root);
        Ok(FileStore { root: root.to_path_buf(), scope, lock: Arc::new(Mutex::new(())) })
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(ENTRY_DIR).join(format!("{}.bin", encode_key(key)))
    }

    fn read_entry(&self, key: &str) -> Result<Option<FileEntry>, StoreError> {
        match fs::read(self.entry_path(key)) {
            Ok(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(codec_err)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn next_index(&self) -> Result<u64, StoreError> {
        let path = self.root.join(INDEX_FILE);
        let last: u64 = match fs::read(&path) {
            Ok(bytes) => bincode::deserialize(&bytes).map_err(codec_err)?,
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let next = last + 1;
        Self::write_atomically(&path, &bincode::serialize(&next).map_err(codec_err)?)?;
        Ok(next)
    }
}

impl DataStore for FileStore {
    fn scope(&self) -> Scope {
        self.scope
    }

    fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError> {
        let _guard = self.guard();
        Ok(self.read_entry(key)?.map(|e| KvPair { value: e.value, index: e.index }))
    }

    fn put_atomic(&self, key: &str, value: &[u8], previous: Option<u64>) -> Result<u64, StoreError> {
        let _guard = self.guard();
        let current = self.read_entry(key)?.map(|e| e.index);
        if current != previous {
            return Err(StoreError::KeyModified);
        }
        let index = self.next_index()?;
        let entry = FileEntry { index, value: value.to_vec() };
        Self::write_atomically(&self.entry_path(key), &bincode::serialize(&entry).map_err(codec_err)?)?;
        Ok(index)
    }

    fn delete_atomic(&self, key: &str, previous: u64) -> Result<(), StoreError> {
        let _guard = self.guard();
        match self.read_entry(key)? {
            None => Err(StoreError::KeyNotFound),
            Some(e) if e.index != previous => Err(StoreError::KeyModified),
            Some(_) => {
                fs::remove_file(self.entry_path(key))?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_encode_key() {
        assert_eq!(encode_key("ipam/default/data/LocalDefault/10.0.0.0/24"), "ipam%2Fdefault%2Fdata%2FLocalDefault%2F10.0.0.0%2F24");
        assert_eq!(encode_key("fd00::/64"), "fd00%3A%3A%2F64");
    }

    #[test]
    fn test_roundtrip_and_cas() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), Scope::Local).unwrap();
        assert!(store.get("a/b").unwrap().is_none());

        let i1 = store.put_atomic("a/b", b"one", None).unwrap();
        assert!(matches!(store.put_atomic("a/b", b"x", None), Err(StoreError::KeyModified)));
        let i2 = store.put_atomic("a/b", b"two", Some(i1)).unwrap();
        assert!(i2 > i1);
        assert!(matches!(store.put_atomic("a/b", b"x", Some(i1)), Err(StoreError::KeyModified)));
        assert_eq!(store.get("a/b").unwrap().unwrap(), KvPair { value: b"two".to_vec(), index: i2 });
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let idx = {
            let store = FileStore::open(dir.path(), Scope::Global).unwrap();
            store.put_atomic("k", b"persisted", None).unwrap()
        };
        let reopened = FileStore::open(dir.path(), Scope::Global).unwrap();
        let kv = reopened.get("k").unwrap().unwrap();
        assert_eq!(kv.value, b"persisted".to_vec());
        assert_eq!(kv.index, idx);
        // indexes keep increasing after a reopen, so an old token never matches again
        let next = reopened.put_atomic("other", b"v", None).unwrap();
        assert!(next > idx);
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), Scope::Local).unwrap();
        let idx = store.put_atomic("k", b"v", None).unwrap();
        assert!(matches!(store.delete_atomic("k", idx + 7), Err(StoreError::KeyModified)));
        store.delete_atomic("k", idx).unwrap();
        assert!(store.get("k").unwrap().is_none());
        assert!(matches!(store.delete_atomic("k", idx), Err(StoreError::KeyNotFound)));
    }
}
