//! In-process store.
//!
//! Clones share the same underlying map, so several allocators built on clones
//! of one `MemoryStore` behave like peer processes sharing a backing store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{DataStore, KvPair, Scope, StoreError};

#[derive(Debug, Default)]
struct MemoryInner {
    entries: HashMap<String, KvPair>,
    last_index: u64,
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    scope: Scope,
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new(scope: Scope) -> Self {
        MemoryStore { scope, inner: Arc::new(Mutex::new(MemoryInner::default())) }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DataStore for MemoryStore {
    fn scope(&self) -> Scope {
        self.scope
    }

    fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError> {
        Ok(self.lock().entries.get(key).cloned())
    }

    fn put_atomic(&self, key: &str, value: &[u8], previous: Option<u64>) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let current = inner.entries.get(key).map(|kv| kv.index);
        if current != previous {
            return Err(StoreError::KeyModified);
        }
        inner.last_index += 1;
        let index = inner.last_index;
        inner.entries.insert(key.to_string(), KvPair { value: value.to_vec(), index });
        Ok(index)
    }

    fn delete_atomic(&self, key: &str, previous: u64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner.entries.get(key) {
            None => Err(StoreError::KeyNotFound),
            Some(kv) if kv.index != previous => Err(StoreError::KeyModified),
            Some(_) => {
                inner.entries.remove(key);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_only_if_absent() {
        let store = MemoryStore::new(Scope::Local);
        let idx = store.put_atomic("k", b"v1", None).unwrap();
        assert!(matches!(store.put_atomic("k", b"v2", None), Err(StoreError::KeyModified)));
        assert_eq!(store.get("k").unwrap().unwrap(), KvPair { value: b"v1".to_vec(), index: idx });
    }

    #[test]
    fn test_stale_index_rejected() {
        let store = MemoryStore::new(Scope::Local);
        let first = store.put_atomic("k", b"v1", None).unwrap();
        let second = store.put_atomic("k", b"v2", Some(first)).unwrap();
        assert!(second > first);
        assert!(matches!(store.put_atomic("k", b"v3", Some(first)), Err(StoreError::KeyModified)));
        assert_eq!(store.get("k").unwrap().unwrap().value, b"v2".to_vec());
    }

    #[test]
    fn test_clones_share_state() {
        let a = MemoryStore::new(Scope::Global);
        let b = a.clone();
        a.put_atomic("k", b"v", None).unwrap();
        assert_eq!(b.get("k").unwrap().unwrap().value, b"v".to_vec());
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_delete_atomic() {
        let store = MemoryStore::new(Scope::Local);
        let idx = store.put_atomic("k", b"v", None).unwrap();
        assert!(matches!(store.delete_atomic("k", idx + 1), Err(StoreError::KeyModified)));
        store.delete_atomic("k", idx).unwrap();
        assert!(store.is_empty());
        assert!(matches!(store.delete_atomic("k", idx), Err(StoreError::KeyNotFound)));
    }
}
