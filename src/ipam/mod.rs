//! Pool and address allocator.
//!
//! The [`Allocator`] owns the address spaces, the predefined pool catalogs and
//! the registry of live bitmap handles. Pool requests mutate a private copy of
//! an address space's database and install it with a version check; a stale
//! copy is discarded and the request retried from a fresh read. Bitmaps for
//! new root pools are only materialized after the install succeeds.
//!
//! ## Locking
//!
//! The allocator lock guards the maps held by the allocator; each address
//! space has its own lock for its database. The two are never held at the
//! same time.

pub mod address_space;
pub mod dhcp;
pub mod retry;

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bitseq::{BitmapError, Handle};
use crate::error::IpamError;
use crate::ip::{predefined, AddressRange, AssignedAddress, Cidr, PoolData, SubnetKey};
use crate::store::{new_store, DataStore, DatastoreConfigData};

pub use address_space::{AddrSpace, PoolCommit, PoolDb};
pub use dhcp::{HostNetwork, NoHostNetwork, VlanLink, DHCP_INTERFACE, MAC_ADDRESS};
pub use retry::RetryPolicy;

/// Address space for host-scoped networks
pub const LOCAL_ADDRESS_SPACE: &str = "LocalDefault";
/// Address space for networks shared across hosts
pub const GLOBAL_ADDRESS_SPACE: &str = "GlobalDefault";

/// Kinds of discovery notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryType {
    NodeDiscovery,
    DatastoreConfig,
    EncryptionKeysConfig,
}

/// Result of a successful pool request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolAllocation {
    pub pool_id: String,
    pub pool: Cidr,
    pub options: HashMap<String, String>,
}

/// Construction-time knobs
#[derive(Debug, Clone)]
pub struct AllocatorOptions {
    pub retry: RetryPolicy,
    pub local_catalog: Vec<Cidr>,
    pub global_catalog: Vec<Cidr>,
    pub host: Arc<dyn HostNetwork>,
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        AllocatorOptions {
            retry: RetryPolicy::default(),
            local_catalog: predefined::broad_networks(),
            global_catalog: predefined::granular_networks(),
            host: Arc::new(NoHostNetwork),
        }
    }
}

#[derive(Debug, Default)]
struct AllocatorState {
    predefined: HashMap<String, Arc<Vec<Cidr>>>,
    addr_spaces: HashMap<String, Arc<AddrSpace>>,
    addresses: HashMap<SubnetKey, Arc<Handle>>,
}

/// A pool request resolved to a concrete subnet
#[derive(Debug, Clone)]
struct PoolRequest {
    key: SubnetKey,
    nw: Cidr,
    range: Option<AddressRange>,
    predefined: bool,
}

/// Per address-space bookkeeping of IPv4/IPv6 pools and addresses
#[derive(Debug)]
pub struct Allocator {
    state: Mutex<AllocatorState>,
    retry: RetryPolicy,
    host: Arc<dyn HostNetwork>,
}

fn bitmap_to_ipam(err: BitmapError) -> IpamError {
    match err {
        BitmapError::BitAllocated => IpamError::IpAlreadyAllocated,
        BitmapError::NoBitAvailable => IpamError::NoAvailableIps,
        BitmapError::Store(e) => IpamError::Store(e),
        other => IpamError::Internal(other.to_string()),
    }
}

impl Allocator {
    /// Build an allocator over the given local and global stores (either may be absent).
    pub fn new(local: Option<Arc<dyn DataStore>>, global: Option<Arc<dyn DataStore>>) -> Result<Self, IpamError> {
        Self::with_options(local, global, AllocatorOptions::default())
    }

    pub fn with_options(
        local: Option<Arc<dyn DataStore>>,
        global: Option<Arc<dyn DataStore>>,
        options: AllocatorOptions,
    ) -> Result<Self, IpamError> {
        let mut state = AllocatorState::default();
        state.predefined.insert(LOCAL_ADDRESS_SPACE.to_string(), Arc::new(options.local_catalog));
        state.predefined.insert(GLOBAL_ADDRESS_SPACE.to_string(), Arc::new(options.global_catalog));

        let a = Allocator { state: Mutex::new(state), retry: options.retry, host: options.host };
        for (name, store) in [(LOCAL_ADDRESS_SPACE, local), (GLOBAL_ADDRESS_SPACE, global)] {
            a.initialize_address_space(name, store)?;
        }
        Ok(a)
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Names of the default local and global address spaces
    pub fn get_default_address_spaces(&self) -> (&'static str, &'static str) {
        (LOCAL_ADDRESS_SPACE, GLOBAL_ADDRESS_SPACE)
    }

    /// (Re)create an address space bound to `store` and reconcile its bitmaps.
    pub fn initialize_address_space(&self, name: &str, store: Option<Arc<dyn DataStore>>) -> Result<(), IpamError> {
        {
            let mut state = self.lock();
            if let Some(current) = state.addr_spaces.get(name) {
                if current.store().is_some() {
                    return Err(IpamError::Forbidden(format!(
                        "a datastore is already configured for the address space {}",
                        name
                    )));
                }
            }
            if let Some(s) = &store {
                log::info!("Binding {} store to address space {}", s.scope(), name);
            }
            state.addr_spaces.insert(name.to_string(), Arc::new(AddrSpace::new(name, store)));
            // handles bound to the previous store are stale now
            state.addresses.retain(|k, _| k.address_space != name);
        }
        self.check_consistency(name);
        Ok(())
    }

    /// Store notification: bind a newly configured global store.
    pub fn discover_new(&self, kind: DiscoveryType, data: &dyn Any) -> Result<(), IpamError> {
        if kind != DiscoveryType::DatastoreConfig {
            return Ok(());
        }
        let dsc = data.downcast_ref::<DatastoreConfigData>().ok_or_else(|| {
            IpamError::Internal("incorrect data in datastore update notification".to_string())
        })?;
        let store = new_store(dsc)?;
        self.initialize_address_space(GLOBAL_ADDRESS_SPACE, Some(store))
    }

    /// Deletion notifications are of no interest to the allocator.
    pub fn discover_delete(&self, _kind: DiscoveryType, _data: &dyn Any) -> Result<(), IpamError> {
        Ok(())
    }

    fn get_addr_space(&self, name: &str) -> Result<Arc<AddrSpace>, IpamError> {
        self.lock().addr_spaces.get(name).cloned().ok_or_else(|| {
            IpamError::NotFound(format!(
                "cannot find address space {} (most likely the backing datastore is not configured)",
                name
            ))
        })
    }

    fn get_store(&self, name: &str) -> Option<Arc<dyn DataStore>> {
        self.lock().addr_spaces.get(name).and_then(|s| s.store())
    }

    fn refresh(&self, name: &str) -> Result<(), IpamError> {
        let space = match self.lock().addr_spaces.get(name) {
            Some(space) => space.clone(),
            None => return Ok(()),
        };
        space.refresh()
    }

    /// Recreate missing bitmaps for the root pools of an address space and
    /// repair damaged ones. Only adds handles; never touches pool records.
    pub fn check_consistency(&self, name: &str) {
        if let Err(e) = self.refresh(name) {
            log::warn!("Could not refresh address space {} before consistency check: {}", name, e);
        }
        let space = match self.get_addr_space(name) {
            Ok(space) => space,
            Err(_) => return,
        };
        let roots: Vec<(SubnetKey, Cidr)> =
            space.with_db(|db| db.roots().map(|(k, p)| (k.clone(), p.pool)).collect());

        for (key, pool) in roots {
            let bm = match self.retrieve_bitmask(&key, &pool) {
                Ok(bm) => bm,
                Err(e) => {
                    log::warn!("Could not recreate bitmask for {}: {}", key, e);
                    continue;
                }
            };
            if let Err(e) = bm.check_consistency() {
                log::warn!("Error while running consistency check for {}: {}", key, e);
            }
        }
    }

    fn insert_bitmask(&self, key: &SubnetKey, pool: &Cidr) -> Result<Arc<Handle>, IpamError> {
        let store = self.get_store(&key.address_space);
        let bits = pool.ordinal_capacity();
        log::debug!("Inserting bitmask ({}, {}) of {} bits", key, pool, bits);

        // persisted allocations, if any, are picked up here
        let h = Handle::new(store, &key.to_string(), bits).map_err(bitmap_to_ipam)?;

        // network address, and broadcast for IPv4, are never handed out
        let mut reserved = vec![0];
        if pool.is_ipv4() {
            reserved.push(bits - 1);
        }
        for ordinal in reserved {
            match h.set(ordinal) {
                Ok(()) | Err(BitmapError::BitAllocated) => {}
                Err(e) => return Err(bitmap_to_ipam(e)),
            }
        }

        // a concurrent caller may have registered one meanwhile; theirs wins
        let h = self.lock().addresses.entry(key.clone()).or_insert_with(|| Arc::new(h)).clone();
        Ok(h)
    }

    fn retrieve_bitmask(&self, key: &SubnetKey, pool: &Cidr) -> Result<Arc<Handle>, IpamError> {
        if let Some(bm) = self.lock().addresses.get(key).cloned() {
            return Ok(bm);
        }
        log::debug!("Retrieving bitmask ({}, {})", key, pool);
        self.insert_bitmask(key, pool)
            .map_err(|e| IpamError::Internal(format!("could not find bitmask in datastore for {}: {}", key, e)))
    }

    fn apply_commit(&self, commit: PoolCommit) -> Result<(), IpamError> {
        match commit {
            PoolCommit::Nothing => Ok(()),
            PoolCommit::InsertBitmap { key, pool } => self.insert_bitmask(&key, &pool).map(|_| ()),
            PoolCommit::RemoveBitmap { key, pool } => {
                let bm = self.retrieve_bitmask(&key, &pool).map_err(|e| {
                    IpamError::Internal(format!("could not find bitmask in datastore for pool {} removal: {}", key, e))
                })?;
                self.lock().addresses.remove(&key);
                bm.destroy().map_err(bitmap_to_ipam)
            }
        }
    }

    fn get_predefined_pool(&self, name: &str, v6: bool) -> Result<Cidr, IpamError> {
        if name != LOCAL_ADDRESS_SPACE && name != GLOBAL_ADDRESS_SPACE {
            return Err(IpamError::NotImplemented(
                "no default pool available for non-default address spaces".to_string(),
            ));
        }
        let space = self.get_addr_space(name)?;
        let catalog = self.lock().predefined.get(name).cloned().unwrap_or_default();

        space
            .with_db(|db| {
                catalog
                    .iter()
                    .filter(|nw| nw.is_ipv4() != v6)
                    .find(|nw| {
                        let key = SubnetKey::new(name, &nw.to_string(), "");
                        !db.subnets.contains_key(&key) && !db.overlaps_root(nw)
                    })
                    .copied()
            })
            .ok_or(IpamError::NoAvailablePool(if v6 { 6 } else { 4 }))
    }

    fn parse_pool_request(&self, address_space: &str, pool: &str, sub_pool: &str, v6: bool) -> Result<PoolRequest, IpamError> {
        if address_space.is_empty() {
            return Err(IpamError::InvalidAddressSpace);
        }
        if pool.is_empty() && !sub_pool.is_empty() {
            return Err(IpamError::InvalidSubPool);
        }

        if pool.is_empty() {
            let nw = self.get_predefined_pool(address_space, v6)?;
            return Ok(PoolRequest {
                key: SubnetKey::new(address_space, &nw.to_string(), ""),
                nw,
                range: None,
                predefined: true,
            });
        }

        let nw: Cidr = pool.parse().map_err(|_| IpamError::InvalidPool)?;
        let (range, child) = if sub_pool.is_empty() {
            (None, String::new())
        } else {
            let sub: Cidr = sub_pool.parse().map_err(|_| IpamError::InvalidSubPool)?;
            (Some(AddressRange::within(sub, &nw)?), sub.to_string())
        };
        Ok(PoolRequest {
            key: SubnetKey::new(address_space, &nw.to_string(), &child),
            nw,
            range,
            predefined: false,
        })
    }

    /// Reserve a pool and return its id.
    ///
    /// With an empty `pool` a subnet is picked from the address space's
    /// predefined catalog. Requesting an explicit pool that already exists
    /// returns the same id and takes another reference on it.
    pub fn request_pool(
        &self,
        address_space: &str,
        pool: &str,
        sub_pool: &str,
        options: &HashMap<String, String>,
        v6: bool,
    ) -> Result<PoolAllocation, IpamError> {
        log::debug!("RequestPool({}, {}, {}, {:?}, {})", address_space, pool, sub_pool, options, v6);

        let mut passthrough = HashMap::new();
        if let Some(iface) = options.get(DHCP_INTERFACE) {
            passthrough.insert(DHCP_INTERFACE.to_string(), iface.clone());
        }

        let mut resolved: Option<PoolRequest> = None;
        let mut attempt = 0;
        loop {
            self.retry.admit(attempt, "RequestPool")?;
            attempt += 1;

            self.refresh(address_space)?;
            let req = match resolved.take() {
                Some(req) => req,
                None => self.parse_pool_request(address_space, pool, sub_pool, v6)?,
            };
            let space = self.get_addr_space(address_space)?;

            let prepared = space.prepare(|db| db.on_add(&req.key, req.nw, req.range.clone(), req.predefined));
            let (snapshot, commit) = match prepared {
                Ok(p) => p,
                Err(e) if e.is_maskable() => {
                    log::debug!("Retrying predefined pool search: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match space.install(snapshot) {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    log::debug!("Retrying pool {} after store conflict: {}", req.key, e);
                    resolved = Some(req);
                    continue;
                }
                Err(e) => {
                    return Err(IpamError::Internal(format!("pool configuration failed because of {}", e)));
                }
            }

            self.apply_commit(commit)?;
            return Ok(PoolAllocation { pool_id: req.key.to_string(), pool: req.nw, options: passthrough });
        }
    }

    /// Release a pool reference; the pool and its bitmap go away with the last one.
    pub fn release_pool(&self, pool_id: &str) -> Result<(), IpamError> {
        log::debug!("ReleasePool({})", pool_id);
        let key: SubnetKey = pool_id
            .parse()
            .map_err(|_| IpamError::BadRequest(format!("invalid pool id: {}", pool_id)))?;

        let mut attempt = 0;
        loop {
            self.retry.admit(attempt, "ReleasePool")?;
            attempt += 1;

            self.refresh(&key.address_space)?;
            let space = self.get_addr_space(&key.address_space)?;
            let (snapshot, commit) = space.prepare(|db| db.on_removal(&key))?;

            match space.install(snapshot) {
                Ok(()) => return self.apply_commit(commit),
                Err(e) if e.is_retryable() => continue,
                Err(e) => {
                    return Err(IpamError::Internal(format!("pool ({}) removal failed because of {}", pool_id, e)));
                }
            }
        }
    }

    /// Look up a pool record and its root, validating `address` against the record.
    fn resolve_pool(&self, pool_id: &str, address: Option<&IpAddr>) -> Result<(PoolData, SubnetKey, Cidr), IpamError> {
        let key: SubnetKey = pool_id
            .parse()
            .map_err(|_| IpamError::BadRequest(format!("invalid pool id: {}", pool_id)))?;
        self.refresh(&key.address_space)?;
        let space = self.get_addr_space(&key.address_space)?;

        let resolved = space.with_db(|db| {
            let p = db
                .subnets
                .get(&key)
                .cloned()
                .ok_or_else(|| IpamError::NotFound(format!("cannot find address pool for poolID:{}", pool_id)))?;
            if let Some(ip) = address {
                if !p.pool.contains(ip) {
                    return Err(IpamError::IpOutOfRange);
                }
            }
            let (root_key, root) = db.root_of(&key)?;
            Ok((p, root_key, root.pool))
        });
        if matches!(resolved, Err(IpamError::NotFound(_))) && key.is_root() {
            // released by a peer allocator
            self.lock().addresses.remove(&key);
        }
        resolved
    }

    /// Hand out an address from a pool: `preferred` if given, else the lowest free one.
    pub fn request_address(
        &self,
        pool_id: &str,
        preferred: Option<IpAddr>,
        options: &HashMap<String, String>,
    ) -> Result<(AssignedAddress, HashMap<String, String>), IpamError> {
        log::debug!("RequestAddress({}, {:?}, {:?})", pool_id, preferred, options);
        let (p, root_key, root_pool) = self.resolve_pool(pool_id, preferred.as_ref())?;

        let dhcp = options.get(DHCP_INTERFACE).filter(|v| !v.is_empty());
        let mac = options.get(MAC_ADDRESS).filter(|v| !v.is_empty());
        if let (Some(iface), Some(mac)) = (dhcp, mac) {
            let ip = dhcp::lease_address(self.host.as_ref(), iface, mac)?;
            return Ok((AssignedAddress { ip, prefix_len: p.pool.prefix_len() }, HashMap::new()));
        }

        let bm = self.retrieve_bitmask(&root_key, &root_pool).map_err(|e| {
            IpamError::Internal(format!(
                "could not find bitmask in datastore for {} on address {:?} request from pool {}: {}",
                root_key, preferred, pool_id, e
            ))
        })?;
        let ip = Self::get_address(&root_pool, &bm, preferred, p.range.as_ref())?;
        Ok((AssignedAddress { ip, prefix_len: p.pool.prefix_len() }, HashMap::new()))
    }

    fn get_address(
        nw: &Cidr,
        bitmask: &Handle,
        preferred: Option<IpAddr>,
        range: Option<&AddressRange>,
    ) -> Result<IpAddr, IpamError> {
        if bitmask.unselected().map_err(bitmap_to_ipam)? == 0 {
            return Err(IpamError::NoAvailableIps);
        }
        let result = match (preferred, range) {
            (Some(ip), _) => {
                let ordinal = nw.ordinal_of(&ip).ok_or(IpamError::IpOutOfRange)?;
                bitmask.set(ordinal).map(|_| ordinal)
            }
            (None, None) => bitmask.set_any(),
            (None, Some(r)) => bitmask.set_any_in_range(r.start, r.end),
        };
        result.map(|ordinal| nw.address_at(ordinal)).map_err(bitmap_to_ipam)
    }

    /// Return an address to its pool.
    pub fn release_address(&self, pool_id: &str, address: IpAddr) -> Result<(), IpamError> {
        log::debug!("ReleaseAddress({}, {})", pool_id, address);
        let (_, root_key, root_pool) = self.resolve_pool(pool_id, Some(&address))?;

        let ordinal = root_pool.ordinal_of(&address).ok_or_else(|| {
            IpamError::Internal(format!("failed to release address {}: host part does not fit an ordinal", address))
        })?;
        if ordinal == 0 || (root_pool.is_ipv4() && ordinal == root_pool.ordinal_capacity() - 1) {
            log::debug!("Ignoring release of reserved address {} in {}", address, root_pool);
            return Ok(());
        }
        let bm = self.retrieve_bitmask(&root_key, &root_pool).map_err(|e| {
            IpamError::Internal(format!(
                "could not find bitmask in datastore for {} on address {} release from pool {}: {}",
                root_key, address, pool_id, e
            ))
        })?;
        bm.unset(ordinal).map_err(bitmap_to_ipam)
    }

    /// Diagnostic dump: address spaces by name, their pools, then every bitmap.
    pub fn dump_database(&self) -> String {
        let spaces: BTreeMap<String, Arc<AddrSpace>> =
            self.lock().addr_spaces.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        let mut s = String::new();
        for (name, space) in &spaces {
            s.push_str(&format!("\n\n{} Config", name));
            let pools: Vec<(SubnetKey, PoolData)> =
                space.with_db(|db| db.subnets.iter().map(|(k, p)| (k.clone(), p.clone())).collect());
            for (key, config) in pools {
                s.push_str(&format!("\n{}: {}", key, config));
                if config.is_root() {
                    if let Err(e) = self.retrieve_bitmask(&key, &config.pool) {
                        log::warn!("Could not materialize bitmask for {}: {}", key, e);
                    }
                }
            }
        }

        s.push_str("\n\nBitmasks");
        let handles: BTreeMap<SubnetKey, Arc<Handle>> =
            self.lock().addresses.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (key, bm) in handles {
            s.push_str(&format!("\n{}: {}", key, bm));
        }
        s
    }

    /// Number of live bitmap handles
    pub fn bitmask_count(&self) -> usize {
        self.lock().addresses.len()
    }
}
