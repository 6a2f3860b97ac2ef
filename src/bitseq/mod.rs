//! Bit-indexed allocator.
//!
//! A [`Handle`] tracks which ordinals of a pool are taken. The state is a
//! sorted list of allocated runs rather than a dense bitmap, so a pool with
//! `u64::MAX` slots costs as much as the number of allocations it holds.
//!
//! When bound to a store, the sequence is persisted under
//! `ipam/default/data/<id>` and every mutation is a version-checked write that
//! re-reads and retries on conflict. Creating a handle for an id that already
//! exists in the store picks up the persisted allocations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::store::{data_key, DataStore, StoreError};

/// Errors reported by bit operations
#[derive(Debug, thiserror::Error)]
pub enum BitmapError {
    #[error("requested bit is already allocated")]
    BitAllocated,

    #[error("no bit available")]
    NoBitAvailable,

    #[error("ordinal {ordinal} is outside the sequence of {bits} bits")]
    InvalidOrdinal { ordinal: u64, bits: u64 },

    #[error("invalid range [{start}, {end}]")]
    InvalidRange { start: u64, end: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Inclusive run of allocated ordinals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub start: u64,
    pub end: u64,
}

impl Run {
    fn len(&self) -> u64 {
        // a run covering every u64 ordinal cannot occur: capacity tops out at u64::MAX
        self.end - self.start + 1
    }
}

/// Persisted allocation state of one pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    bits: u64,
    unselected: u64,
    runs: Vec<Run>,
}

impl Sequence {
    pub fn new(bits: u64) -> Self {
        Sequence { bits, unselected: bits, runs: Vec::new() }
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn unselected(&self) -> u64 {
        self.unselected
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    fn check_ordinal(&self, ordinal: u64) -> Result<(), BitmapError> {
        if ordinal >= self.bits {
            return Err(BitmapError::InvalidOrdinal { ordinal, bits: self.bits });
        }
        Ok(())
    }

    /// Index of the run containing `ordinal`, or where one would be inserted
    fn locate(&self, ordinal: u64) -> Result<usize, usize> {
        self.runs.binary_search_by(|r| {
            if r.end < ordinal {
                std::cmp::Ordering::Less
            } else if r.start > ordinal {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        })
    }

    pub fn is_set(&self, ordinal: u64) -> bool {
        self.locate(ordinal).is_ok()
    }

    pub fn set(&mut self, ordinal: u64) -> Result<(), BitmapError> {
        self.check_ordinal(ordinal)?;
        let at = match self.locate(ordinal) {
            Ok(_) => return Err(BitmapError::BitAllocated),
            Err(at) => at,
        };
        let joins_prev = at > 0 && self.runs[at - 1].end.checked_add(1) == Some(ordinal);
        let joins_next = at < self.runs.len() && ordinal.checked_add(1) == Some(self.runs[at].start);
        match (joins_prev, joins_next) {
            (true, true) => {
                self.runs[at - 1].end = self.runs[at].end;
                self.runs.remove(at);
            }
            (true, false) => self.runs[at - 1].end = ordinal,
            (false, true) => self.runs[at].start = ordinal,
            (false, false) => self.runs.insert(at, Run { start: ordinal, end: ordinal }),
        }
        self.unselected = self.unselected.saturating_sub(1);
        Ok(())
    }

    /// Lowest free ordinal in `[start, end]`, without allocating it
    pub fn first_free_in(&self, start: u64, end: u64) -> Result<u64, BitmapError> {
        if start > end || end >= self.bits {
            return Err(BitmapError::InvalidRange { start, end });
        }
        let mut candidate = start;
        let from = match self.locate(start) {
            Ok(i) | Err(i) => i,
        };
        for run in &self.runs[from..] {
            if run.start > candidate {
                break;
            }
            candidate = run.end.checked_add(1).ok_or(BitmapError::NoBitAvailable)?;
            if candidate > end {
                return Err(BitmapError::NoBitAvailable);
            }
        }
        Ok(candidate)
    }

    pub fn set_any_in_range(&mut self, start: u64, end: u64) -> Result<u64, BitmapError> {
        let ordinal = self.first_free_in(start, end)?;
        self.set(ordinal)?;
        Ok(ordinal)
    }

    pub fn set_any(&mut self) -> Result<u64, BitmapError> {
        if self.bits == 0 || self.unselected == 0 {
            return Err(BitmapError::NoBitAvailable);
        }
        self.set_any_in_range(0, self.bits - 1)
    }

    /// Clear `ordinal`. Clearing a free bit is a no-op.
    pub fn unset(&mut self, ordinal: u64) -> Result<(), BitmapError> {
        self.check_ordinal(ordinal)?;
        let at = match self.locate(ordinal) {
            Ok(at) => at,
            Err(_) => return Ok(()),
        };
        let run = self.runs[at];
        match (run.start == ordinal, run.end == ordinal) {
            (true, true) => {
                self.runs.remove(at);
            }
            (true, false) => self.runs[at].start = ordinal + 1,
            (false, true) => self.runs[at].end = ordinal - 1,
            (false, false) => {
                self.runs[at].end = ordinal - 1;
                self.runs.insert(at + 1, Run { start: ordinal + 1, end: run.end });
            }
        }
        self.unselected = (self.unselected + 1).min(self.bits);
        Ok(())
    }

    /// Rebuild the run list into canonical form.
    ///
    /// Runs are sorted, clipped to the capacity, and overlapping or adjacent
    /// runs are merged; the free counter is recomputed. Returns whether
    /// anything had to change.
    pub fn repair(&mut self) -> bool {
        let mut runs: Vec<Run> = self
            .runs
            .iter()
            .filter(|r| r.start <= r.end && r.start < self.bits)
            .map(|r| Run { start: r.start, end: r.end.min(self.bits - 1) })
            .collect();
        runs.sort_by_key(|r| r.start);

        let mut merged: Vec<Run> = Vec::with_capacity(runs.len());
        for run in runs {
            match merged.last_mut() {
                Some(last) if last.end.checked_add(1).map_or(true, |next| run.start <= next) => {
                    last.end = last.end.max(run.end);
                }
                _ => merged.push(run),
            }
        }

        let used: u64 = merged.iter().map(Run::len).sum();
        let unselected = self.bits - used;
        let changed = merged != self.runs || unselected != self.unselected;
        self.runs = merged;
        self.unselected = unselected;
        changed
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bits: {}, Unselected: {}, Sequence: [", self.bits, self.unselected)?;
        for (i, r) in self.runs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if r.start == r.end {
                write!(f, "{}", r.start)?;
            } else {
                write!(f, "{}-{}", r.start, r.end)?;
            }
        }
        write!(f, "]")
    }
}

#[derive(Debug)]
struct HandleState {
    seq: Sequence,
    index: Option<u64>,
}

/// Shared, optionally persisted allocation bitmap for one root pool
#[derive(Debug)]
pub struct Handle {
    id: String,
    store: Option<Arc<dyn DataStore>>,
    state: Mutex<HandleState>,
}

fn encode(seq: &Sequence) -> Result<Vec<u8>, BitmapError> {
    bincode::serialize(seq).map_err(|e| StoreError::Codec(e.to_string()).into())
}

fn decode(bytes: &[u8]) -> Result<Sequence, BitmapError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()).into())
}

impl Handle {
    /// Create a handle of `bits` slots, loading persisted state for `id` if the store has it.
    pub fn new(store: Option<Arc<dyn DataStore>>, id: &str, bits: u64) -> Result<Self, BitmapError> {
        let handle = Handle {
            id: id.to_string(),
            store,
            state: Mutex::new(HandleState { seq: Sequence::new(bits), index: None }),
        };

        if let Some(store) = &handle.store {
            let key = data_key(id);
            let mut state = handle.lock();
            loop {
                if let Some(kv) = store.get(&key)? {
                    let seq = decode(&kv.value)?;
                    if seq.bits == bits {
                        state.seq = seq;
                        state.index = Some(kv.index);
                        break;
                    }
                    log::warn!("Discarding persisted bitmap {} sized {} bits, expected {}", id, seq.bits, bits);
                    match store.put_atomic(&key, &encode(&state.seq)?, Some(kv.index)) {
                        Ok(index) => {
                            state.index = Some(index);
                            break;
                        }
                        Err(StoreError::KeyModified) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                match store.put_atomic(&key, &encode(&state.seq)?, None) {
                    Ok(index) => {
                        state.index = Some(index);
                        break;
                    }
                    Err(StoreError::KeyModified) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(handle)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pull the latest persisted sequence into `state`.
    fn refresh(&self, state: &mut HandleState) -> Result<(), BitmapError> {
        if let Some(store) = &self.store {
            if let Some(kv) = store.get(&data_key(&self.id))? {
                if state.index != Some(kv.index) {
                    state.seq = decode(&kv.value)?;
                    state.index = Some(kv.index);
                }
            } else if state.index.is_some() {
                // destroyed by a peer: unusable until someone persists the id again
                return Err(StoreError::KeyNotFound.into());
            }
        }
        Ok(())
    }

    /// Apply `op` to a copy of the latest sequence and commit it with compare-and-swap.
    fn update<T>(&self, op: impl Fn(&mut Sequence) -> Result<T, BitmapError>) -> Result<T, BitmapError> {
        let mut state = self.lock();
        loop {
            self.refresh(&mut state)?;
            let mut next = state.seq.clone();
            let out = op(&mut next)?;
            let store = match &self.store {
                None => {
                    state.seq = next;
                    return Ok(out);
                }
                Some(store) => store,
            };
            match store.put_atomic(&data_key(&self.id), &encode(&next)?, state.index) {
                Ok(index) => {
                    state.seq = next;
                    state.index = Some(index);
                    return Ok(out);
                }
                Err(StoreError::KeyModified) => {
                    log::debug!("Bitmap {} changed underneath, retrying", self.id);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn set(&self, ordinal: u64) -> Result<(), BitmapError> {
        self.update(|seq| seq.set(ordinal))
    }

    pub fn set_any(&self) -> Result<u64, BitmapError> {
        self.update(Sequence::set_any)
    }

    pub fn set_any_in_range(&self, start: u64, end: u64) -> Result<u64, BitmapError> {
        self.update(|seq| seq.set_any_in_range(start, end))
    }

    pub fn unset(&self, ordinal: u64) -> Result<(), BitmapError> {
        self.update(|seq| seq.unset(ordinal))
    }

    pub fn is_set(&self, ordinal: u64) -> Result<bool, BitmapError> {
        let mut state = self.lock();
        self.refresh(&mut state)?;
        Ok(state.seq.is_set(ordinal))
    }

    pub fn bits(&self) -> u64 {
        self.lock().seq.bits()
    }

    /// Free slots as of the last read
    pub fn unselected(&self) -> Result<u64, BitmapError> {
        let mut state = self.lock();
        self.refresh(&mut state)?;
        Ok(state.seq.unselected())
    }

    /// Detect and repair a damaged sequence. Returns `true` if a repair was written.
    pub fn check_consistency(&self) -> Result<bool, BitmapError> {
        let repaired = self.update(|seq| {
            let mut copy = seq.clone();
            let changed = copy.repair();
            if changed {
                *seq = copy;
            }
            Ok(changed)
        })?;
        if repaired {
            log::warn!("Fixed inconsistent bit sequence for {}", self.id);
        }
        Ok(repaired)
    }

    /// Remove the persisted sequence.
    pub fn destroy(&self) -> Result<(), BitmapError> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(()),
        };
        let key = data_key(&self.id);
        loop {
            let kv = match store.get(&key)? {
                Some(kv) => kv,
                None => return Ok(()),
            };
            match store.delete_atomic(&key, kv.index) {
                Ok(()) | Err(StoreError::KeyNotFound) => return Ok(()),
                Err(StoreError::KeyModified) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        write!(f, "ID: {}, {}", self.id, state.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Scope};

    #[test]
    fn test_set_any_lowest_first() {
        let mut seq = Sequence::new(8);
        assert_eq!(seq.set_any().unwrap(), 0);
        assert_eq!(seq.set_any().unwrap(), 1);
        seq.set(3).unwrap();
        assert_eq!(seq.set_any().unwrap(), 2);
        assert_eq!(seq.set_any().unwrap(), 4);
        assert_eq!(seq.runs(), &[Run { start: 0, end: 4 }]);
        assert_eq!(seq.unselected(), 3);
    }

    #[test]
    fn test_set_twice_fails() {
        let mut seq = Sequence::new(4);
        seq.set(2).unwrap();
        assert!(matches!(seq.set(2), Err(BitmapError::BitAllocated)));
        assert!(matches!(seq.set(4), Err(BitmapError::InvalidOrdinal { .. })));
    }

    #[test]
    fn test_exhaustion() {
        let mut seq = Sequence::new(3);
        for _ in 0..3 {
            seq.set_any().unwrap();
        }
        assert!(matches!(seq.set_any(), Err(BitmapError::NoBitAvailable)));
    }

    #[test]
    fn test_range_allocation() {
        let mut seq = Sequence::new(256);
        seq.set(10).unwrap();
        seq.set(11).unwrap();
        assert_eq!(seq.set_any_in_range(10, 13).unwrap(), 12);
        assert_eq!(seq.set_any_in_range(10, 13).unwrap(), 13);
        assert!(matches!(seq.set_any_in_range(10, 13), Err(BitmapError::NoBitAvailable)));
        assert!(matches!(seq.set_any_in_range(5, 300), Err(BitmapError::InvalidRange { .. })));
        assert!(matches!(seq.set_any_in_range(9, 3), Err(BitmapError::InvalidRange { .. })));
        assert_eq!(seq.set_any_in_range(0, 255).unwrap(), 0);
    }

    #[test]
    fn test_unset_splits_runs() {
        let mut seq = Sequence::new(16);
        for o in 0..6 {
            seq.set(o).unwrap();
        }
        seq.unset(2).unwrap();
        assert_eq!(seq.runs(), &[Run { start: 0, end: 1 }, Run { start: 3, end: 5 }]);
        assert_eq!(seq.unselected(), 11);
        // clearing an already free bit does not disturb the counters
        seq.unset(2).unwrap();
        seq.unset(9).unwrap();
        assert_eq!(seq.unselected(), 11);
        assert_eq!(seq.set_any().unwrap(), 2);
    }

    #[test]
    fn test_full_width_sequence() {
        let mut seq = Sequence::new(u64::MAX);
        seq.set(0).unwrap();
        assert_eq!(seq.set_any().unwrap(), 1);
        seq.set(u64::MAX - 1).unwrap();
        assert!(matches!(seq.set(u64::MAX), Err(BitmapError::InvalidOrdinal { .. })));
        assert_eq!(seq.unselected(), u64::MAX - 3);
    }

    #[test]
    fn test_repair() {
        let mut seq = Sequence {
            bits: 16,
            unselected: 1,
            runs: vec![
                Run { start: 6, end: 8 },
                Run { start: 0, end: 2 },
                Run { start: 2, end: 4 },
                Run { start: 9, end: 9 },
                Run { start: 14, end: 40 },
                Run { start: 20, end: 22 },
                Run { start: 12, end: 11 },
            ],
        };
        assert!(seq.repair());
        assert_eq!(seq.runs(), &[Run { start: 0, end: 4 }, Run { start: 6, end: 9 }, Run { start: 14, end: 15 }]);
        assert_eq!(seq.unselected(), 5);
        assert!(!seq.repair());
    }

    #[test]
    fn test_handle_persists_and_reloads() {
        let store = MemoryStore::new(Scope::Local);
        let shared: Arc<dyn DataStore> = Arc::new(store.clone());
        {
            let h = Handle::new(Some(shared.clone()), "pool", 32).unwrap();
            h.set(0).unwrap();
            assert_eq!(h.set_any().unwrap(), 1);
        }
        let reloaded = Handle::new(Some(shared), "pool", 32).unwrap();
        assert!(reloaded.is_set(1).unwrap());
        assert_eq!(reloaded.set_any().unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_handles_sharing_a_store_never_hand_out_the_same_bit() {
        let shared: Arc<dyn DataStore> = Arc::new(MemoryStore::new(Scope::Global));
        let a = Handle::new(Some(shared.clone()), "pool", 8).unwrap();
        let b = Handle::new(Some(shared), "pool", 8).unwrap();
        let x = a.set_any().unwrap();
        let y = b.set_any().unwrap();
        let z = a.set_any().unwrap();
        assert_eq!((x, y, z), (0, 1, 2));
        assert_eq!(b.unselected().unwrap(), 5);
    }

    #[test]
    fn test_handle_consistency_check_rewrites_store() {
        let store = MemoryStore::new(Scope::Local);
        let damaged = Sequence { bits: 8, unselected: 8, runs: vec![Run { start: 3, end: 3 }, Run { start: 1, end: 3 }] };
        store.put_atomic(&data_key("pool"), &encode(&damaged).unwrap(), None).unwrap();

        let shared: Arc<dyn DataStore> = Arc::new(store.clone());
        let h = Handle::new(Some(shared), "pool", 8).unwrap();
        assert!(h.check_consistency().unwrap());
        assert!(!h.check_consistency().unwrap());

        let kv = store.get(&data_key("pool")).unwrap().unwrap();
        let fixed = decode(&kv.value).unwrap();
        assert_eq!(fixed.runs(), &[Run { start: 1, end: 3 }]);
        assert_eq!(fixed.unselected(), 5);
    }

    #[test]
    fn test_destroy_removes_record() {
        let store = MemoryStore::new(Scope::Local);
        let shared: Arc<dyn DataStore> = Arc::new(store.clone());
        let h = Handle::new(Some(shared), "pool", 8).unwrap();
        h.set(1).unwrap();
        h.destroy().unwrap();
        assert!(store.is_empty());
        h.destroy().unwrap();
    }

    #[test]
    fn test_handle_does_not_resurrect_destroyed_record() {
        let store = MemoryStore::new(Scope::Local);
        let shared: Arc<dyn DataStore> = Arc::new(store.clone());
        let stale = Handle::new(Some(shared.clone()), "pool", 8).unwrap();
        stale.set(1).unwrap();

        let peer = Handle::new(Some(shared.clone()), "pool", 8).unwrap();
        peer.destroy().unwrap();

        assert!(matches!(stale.set(2), Err(BitmapError::Store(StoreError::KeyNotFound))));
        assert!(matches!(stale.unselected(), Err(BitmapError::Store(StoreError::KeyNotFound))));
        assert!(store.is_empty());

        // recreated under the same id: the old handle follows the new record
        let fresh = Handle::new(Some(shared), "pool", 8).unwrap();
        fresh.set(4).unwrap();
        assert!(!stale.is_set(1).unwrap());
        assert_eq!(stale.set_any().unwrap(), 0);
        assert!(fresh.is_set(0).unwrap());
    }

    #[test]
    fn test_handle_display() {
        let h = Handle::new(None, "LocalDefault/10.0.0.0/30", 4).unwrap();
        h.set(0).unwrap();
        h.set(3).unwrap();
        assert_eq!(h.to_string(), "ID: LocalDefault/10.0.0.0/30, Bits: 4, Unselected: 2, Sequence: [0, 3]");
    }
}
