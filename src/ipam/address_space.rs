//! Address-space pool database.
//!
//! Each address space owns a map of pool identities to pool records. Mutations
//! happen in two phases: [`PoolDb::on_add`] / [`PoolDb::on_removal`] compute
//! the next state on a private copy and return a [`PoolCommit`] describing the
//! bitmap side effect; the copy is then installed with a version check, and
//! only after that does the caller apply the commit.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::IpamError;
use crate::ip::{AddressRange, Cidr, PoolData, SubnetKey};
use crate::store::{config_key, DataStore, Scope, StoreError};

/// Bitmap side effect of a successful pool database update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolCommit {
    /// Nothing beyond the database change
    Nothing,
    /// A new root pool was added; materialize its bitmap
    InsertBitmap { key: SubnetKey, pool: Cidr },
    /// A root pool lost its last reference; drop its bitmap
    RemoveBitmap { key: SubnetKey, pool: Cidr },
}

/// Pool map of one address space, as persisted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDb {
    pub subnets: BTreeMap<SubnetKey, PoolData>,
}

impl PoolDb {
    /// Whether `nw` intersects any root pool
    pub fn overlaps_root(&self, nw: &Cidr) -> bool {
        self.subnets.values().any(|p| p.is_root() && p.pool.overlaps(nw))
    }

    /// Walk the parent chain of `key` up to its root record.
    pub fn root_of(&self, key: &SubnetKey) -> Result<(SubnetKey, &PoolData), IpamError> {
        let mut k = key.clone();
        let mut c = self
            .subnets
            .get(&k)
            .ok_or_else(|| IpamError::NotFound(format!("cannot find address pool for poolID:{}", key)))?;
        while !c.is_root() {
            let parent = c
                .parent_key
                .clone()
                .ok_or_else(|| IpamError::Internal(format!("pool {} has a range but no parent", k)))?;
            c = self
                .subnets
                .get(&parent)
                .ok_or_else(|| IpamError::Internal(format!("parent {} of pool {} is missing", parent, k)))?;
            k = parent;
        }
        Ok((k, c))
    }

    fn inc_ref_count(&mut self, key: &SubnetKey, delta: i64) {
        let mut next = Some(key.clone());
        while let Some(k) = next {
            next = match self.subnets.get_mut(&k) {
                Some(p) => {
                    p.ref_count = (p.ref_count as i64 + delta).max(0) as u32;
                    p.parent_key.clone()
                }
                None => None,
            };
        }
    }

    /// Record a pool request.
    ///
    /// An identical explicit request bumps the reference count and reuses the
    /// pool; an identical catalog pick is reported as maskable so the caller
    /// chooses again.
    pub fn on_add(
        &mut self,
        key: &SubnetKey,
        nw: Cidr,
        range: Option<AddressRange>,
        predefined: bool,
    ) -> Result<PoolCommit, IpamError> {
        if self.subnets.contains_key(key) {
            if predefined {
                return Err(IpamError::Maskable(format!("predefined pool {} is already reserved", nw)));
            }
            self.inc_ref_count(key, 1);
            return Ok(PoolCommit::Nothing);
        }

        let range = match range {
            None => {
                if self.overlaps_root(&nw) {
                    return Err(IpamError::PoolOverlap);
                }
                self.subnets.insert(key.clone(), PoolData::root(nw));
                return Ok(PoolCommit::InsertBitmap { key: key.clone(), pool: nw });
            }
            Some(range) => range,
        };

        let parent_key = key.root();
        self.subnets.insert(key.clone(), PoolData::derived(parent_key.clone(), nw, range));
        if self.subnets.contains_key(&parent_key) {
            self.inc_ref_count(&parent_key, 1);
            return Ok(PoolCommit::Nothing);
        }

        if self.overlaps_root(&nw) {
            self.subnets.remove(key);
            return Err(IpamError::PoolOverlap);
        }
        self.subnets.insert(parent_key.clone(), PoolData::root(nw));
        Ok(PoolCommit::InsertBitmap { key: parent_key, pool: nw })
    }

    /// Drop one reference to `key`, removing every record on its chain that reaches zero.
    pub fn on_removal(&mut self, key: &SubnetKey) -> Result<PoolCommit, IpamError> {
        if !self.subnets.contains_key(key) {
            return Err(IpamError::NotFound(format!("address space does not contain pool {}", key)));
        }
        self.inc_ref_count(key, -1);

        let mut commit = PoolCommit::Nothing;
        let mut next = Some(key.clone());
        while let Some(k) = next {
            let p = match self.subnets.get(&k) {
                Some(p) => p.clone(),
                None => break,
            };
            if p.ref_count == 0 {
                self.subnets.remove(&k);
                if p.is_root() {
                    commit = PoolCommit::RemoveBitmap { key: k.clone(), pool: p.pool };
                }
            }
            next = p.parent_key;
        }
        Ok(commit)
    }

    pub fn roots(&self) -> impl Iterator<Item = (&SubnetKey, &PoolData)> {
        self.subnets.iter().filter(|(_, p)| p.is_root())
    }
}

#[derive(Debug, Default)]
struct AddrSpaceState {
    db: PoolDb,
    /// Version the local copy was read at; `None` until first persisted
    index: Option<u64>,
    /// Bumped on every install, to detect lost updates without a store
    generation: u64,
}

/// Private copy of an address space's database, plus the version it was taken at
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub db: PoolDb,
    index: Option<u64>,
    generation: u64,
}

/// One address space: its pool database and the store it is persisted in
#[derive(Debug)]
pub struct AddrSpace {
    name: String,
    store: Option<Arc<dyn DataStore>>,
    state: Mutex<AddrSpaceState>,
}

impl AddrSpace {
    pub fn new(name: &str, store: Option<Arc<dyn DataStore>>) -> Self {
        AddrSpace { name: name.to_string(), store, state: Mutex::new(AddrSpaceState::default()) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> Option<Arc<dyn DataStore>> {
        self.store.clone()
    }

    pub fn scope(&self) -> Option<Scope> {
        self.store.as_ref().map(|s| s.scope())
    }

    fn lock(&self) -> MutexGuard<'_, AddrSpaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-read the persisted database. Without a store, or before anything was
    /// persisted, the in-memory state is kept.
    pub fn refresh(&self) -> Result<(), IpamError> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(()),
        };
        let kv = store
            .get(&config_key(&self.name))
            .map_err(|e| IpamError::Internal(format!("error getting pools config from store: {}", e)))?;
        if let Some(kv) = kv {
            let mut state = self.lock();
            if state.index != Some(kv.index) {
                state.db = serde_json::from_slice(&kv.value)
                    .map_err(|e| IpamError::Internal(format!("could not decode pools config for {}: {}", self.name, e)))?;
                state.index = Some(kv.index);
                state.generation += 1;
            }
        }
        Ok(())
    }

    /// Run `f` against the current database.
    pub fn with_db<T>(&self, f: impl FnOnce(&PoolDb) -> T) -> T {
        f(&self.lock().db)
    }

    /// Compute the next state with `f` on a private copy (prepare phase).
    pub fn prepare<T>(&self, f: impl FnOnce(&mut PoolDb) -> Result<T, IpamError>) -> Result<(Snapshot, T), IpamError> {
        let mut snapshot = {
            let state = self.lock();
            Snapshot { db: state.db.clone(), index: state.index, generation: state.generation }
        };
        let out = f(&mut snapshot.db)?;
        Ok((snapshot, out))
    }

    /// Install a prepared copy if nobody changed the database since it was taken.
    ///
    /// A stale copy yields [`IpamError::Retry`].
    pub fn install(&self, snapshot: Snapshot) -> Result<(), IpamError> {
        let mut state = self.lock();
        if state.generation != snapshot.generation {
            return Err(IpamError::Retry(format!("address space {} changed during the update", self.name)));
        }
        if let Some(store) = &self.store {
            let value = serde_json::to_vec(&snapshot.db)
                .map_err(|e| IpamError::Store(StoreError::Codec(e.to_string())))?;
            match store.put_atomic(&config_key(&self.name), &value, snapshot.index) {
                Ok(index) => state.index = Some(index),
                Err(StoreError::KeyModified) => {
                    return Err(IpamError::Retry(
                        "failed to perform atomic write (key modified since last read). retry might fix the error".to_string(),
                    ))
                }
                Err(e) => return Err(e.into()),
            }
        }
        state.db = snapshot.db;
        state.generation += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const AS: &str = "LocalDefault";

    fn cidr(s: &str) -> Cidr {
        s.parse().unwrap()
    }

    fn root_key(subnet: &str) -> SubnetKey {
        SubnetKey::new(AS, subnet, "")
    }

    #[test]
    fn test_add_root_and_overlap() {
        let mut db = PoolDb::default();
        let k = root_key("10.0.0.0/16");
        let commit = db.on_add(&k, cidr("10.0.0.0/16"), None, false).unwrap();
        assert_eq!(commit, PoolCommit::InsertBitmap { key: k.clone(), pool: cidr("10.0.0.0/16") });

        let inner = root_key("10.0.5.0/24");
        assert!(matches!(db.on_add(&inner, cidr("10.0.5.0/24"), None, false), Err(IpamError::PoolOverlap)));
        let outer = root_key("10.0.0.0/8");
        assert!(matches!(db.on_add(&outer, cidr("10.0.0.0/8"), None, false), Err(IpamError::PoolOverlap)));
        assert_eq!(db.subnets.len(), 1);
    }

    #[test]
    fn test_duplicate_explicit_pool_is_ref_counted() {
        let mut db = PoolDb::default();
        let k = root_key("10.0.0.0/16");
        db.on_add(&k, cidr("10.0.0.0/16"), None, false).unwrap();
        assert_eq!(db.on_add(&k, cidr("10.0.0.0/16"), None, false).unwrap(), PoolCommit::Nothing);
        assert_eq!(db.subnets[&k].ref_count, 2);

        assert_eq!(db.on_removal(&k).unwrap(), PoolCommit::Nothing);
        assert_eq!(db.subnets[&k].ref_count, 1);
        assert_eq!(
            db.on_removal(&k).unwrap(),
            PoolCommit::RemoveBitmap { key: k.clone(), pool: cidr("10.0.0.0/16") }
        );
        assert!(db.subnets.is_empty());
    }

    #[test]
    fn test_duplicate_predefined_pool_is_maskable() {
        let mut db = PoolDb::default();
        let k = root_key("172.17.0.0/16");
        db.on_add(&k, cidr("172.17.0.0/16"), None, true).unwrap();
        let err = db.on_add(&k, cidr("172.17.0.0/16"), None, true).unwrap_err();
        assert!(err.is_maskable());
        assert_eq!(db.subnets[&k].ref_count, 1);
    }

    #[test]
    fn test_derived_pool_creates_parent() {
        let mut db = PoolDb::default();
        let nw = cidr("10.0.0.0/16");
        let child = SubnetKey::new(AS, "10.0.0.0/16", "10.0.1.0/24");
        let range = AddressRange::within(cidr("10.0.1.0/24"), &nw).unwrap();
        let commit = db.on_add(&child, nw, Some(range), false).unwrap();
        assert_eq!(commit, PoolCommit::InsertBitmap { key: child.root(), pool: nw });
        assert_eq!(db.subnets.len(), 2);
        assert_eq!(db.subnets[&child].parent_key, Some(child.root()));

        let (root, data) = db.root_of(&child).unwrap();
        assert_eq!(root, child.root());
        assert!(data.is_root());
    }

    #[test]
    fn test_derived_pool_chain_ref_counts() {
        let mut db = PoolDb::default();
        let nw = cidr("10.0.0.0/16");
        let root = root_key("10.0.0.0/16");
        db.on_add(&root, nw, None, false).unwrap();

        let child = SubnetKey::new(AS, "10.0.0.0/16", "10.0.1.0/24");
        let range = AddressRange::within(cidr("10.0.1.0/24"), &nw).unwrap();
        assert_eq!(db.on_add(&child, nw, Some(range), false).unwrap(), PoolCommit::Nothing);
        assert_eq!(db.subnets[&root].ref_count, 2);

        // releasing the root first leaves it alive for the child
        assert_eq!(db.on_removal(&root).unwrap(), PoolCommit::Nothing);
        assert_eq!(db.subnets[&root].ref_count, 1);
        assert_eq!(db.on_removal(&child).unwrap(), PoolCommit::RemoveBitmap { key: root.clone(), pool: nw });
        assert!(db.subnets.is_empty());
    }

    #[test]
    fn test_derived_pool_without_parent_checks_overlap() {
        let mut db = PoolDb::default();
        db.on_add(&root_key("10.0.0.0/8"), cidr("10.0.0.0/8"), None, false).unwrap();
        let nw = cidr("10.1.0.0/16");
        let child = SubnetKey::new(AS, "10.1.0.0/16", "10.1.1.0/24");
        let range = AddressRange::within(cidr("10.1.1.0/24"), &nw).unwrap();
        assert!(matches!(db.on_add(&child, nw, Some(range), false), Err(IpamError::PoolOverlap)));
        assert_eq!(db.subnets.len(), 1);
    }

    #[test]
    fn test_removal_of_unknown_pool() {
        let mut db = PoolDb::default();
        db.on_add(&root_key("10.0.0.0/16"), cidr("10.0.0.0/16"), None, false).unwrap();
        let before = db.clone();
        assert!(matches!(db.on_removal(&root_key("10.9.0.0/16")), Err(IpamError::NotFound(_))));
        assert_eq!(db, before);
    }

    #[test]
    fn test_install_detects_concurrent_update_without_store() {
        let space = AddrSpace::new(AS, None);
        let (first, _) = space.prepare(|db| db.on_add(&root_key("10.0.0.0/16"), cidr("10.0.0.0/16"), None, false)).unwrap();
        let (second, _) = space.prepare(|db| db.on_add(&root_key("10.1.0.0/16"), cidr("10.1.0.0/16"), None, false)).unwrap();
        space.install(first).unwrap();
        assert!(space.install(second).unwrap_err().is_retryable());
        assert_eq!(space.with_db(|db| db.subnets.len()), 1);
    }

    #[test]
    fn test_install_and_refresh_through_store() {
        let store = MemoryStore::new(Scope::Local);
        let a = AddrSpace::new(AS, Some(Arc::new(store.clone())));
        let b = AddrSpace::new(AS, Some(Arc::new(store.clone())));

        let (snap, _) = a.prepare(|db| db.on_add(&root_key("10.0.0.0/16"), cidr("10.0.0.0/16"), None, false)).unwrap();
        a.install(snap).unwrap();

        // b's copy predates a's write
        let (stale, _) = b.prepare(|db| db.on_add(&root_key("10.0.0.0/16"), cidr("10.0.0.0/16"), None, false)).unwrap();
        assert!(b.install(stale).unwrap_err().is_retryable());

        b.refresh().unwrap();
        let err = b.prepare(|db| db.on_add(&root_key("10.0.0.0/8"), cidr("10.0.0.0/8"), None, false)).unwrap_err();
        assert!(matches!(err, IpamError::PoolOverlap));
        assert_eq!(b.with_db(|db| db.subnets.len()), 1);
    }
}
