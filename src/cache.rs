// Multi-level alignment cache.
//
// Seed range lookups are memoized across three scopes: the current
// read (cleared per read), a thread-local byte-bounded scope, and an
// optional process-shared scope. Lookup order is current -> local ->
// shared; promotion happens at read finalization and copies a value out
// of one scope before locking the next, so no two cache locks are ever
// held at once.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::index::IndexRange;
use crate::read::Orientation;

/// Default byte budget for the current-read scope.
pub const CURRENT_CACHE_BYTES: usize = 16 * 1024 * 1024;
/// Default byte budget for the thread-local scope.
pub const LOCAL_CACHE_BYTES: usize = 32 * 1024 * 1024;
/// Default byte budget for the process-shared scope.
pub const SHARED_CACHE_BYTES: usize = 64 * 1024 * 1024;

/// Canonicalized seed query: the base codes plus the orientation bit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub query: Vec<u8>,
    pub fw: bool,
}

impl CacheKey {
    pub fn new(query: &[u8], orient: Orientation) -> Self {
        CacheKey {
            query: query.to_vec(),
            fw: orient.is_fw(),
        }
    }

    fn footprint(&self) -> usize {
        std::mem::size_of::<CacheKey>() + self.query.len()
    }
}

/// Cached result of a seed search: the index range plus whatever
/// reference coordinates have been resolved so far. Once stored in the
/// local or shared scope the value never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheVal {
    pub range: IndexRange,
    /// Resolved (ref id, ref offset) pairs, in resolution order.
    pub resolved: Vec<(usize, u64)>,
}

impl CacheVal {
    pub fn new(range: IndexRange) -> Self {
        CacheVal {
            range,
            resolved: Vec::new(),
        }
    }

    fn footprint(&self) -> usize {
        std::mem::size_of::<CacheVal>() + self.resolved.len() * std::mem::size_of::<(usize, u64)>()
    }
}

/// One bounded cache scope. Insertion is check-then-insert; eviction
/// pops the oldest entries until the new one fits.
pub struct CacheScope {
    map: HashMap<CacheKey, CacheVal>,
    order: VecDeque<CacheKey>,
    bytes: usize,
    byte_budget: usize,
}

impl CacheScope {
    pub fn new(byte_budget: usize) -> Self {
        CacheScope {
            map: HashMap::new(),
            order: VecDeque::new(),
            bytes: 0,
            byte_budget,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CacheVal> {
        self.map.get(key)
    }

    /// Insert unless present. Returns Err when the entry cannot fit
    /// even after eviction; the caller absorbs that as a counter.
    pub fn insert(&mut self, key: CacheKey, val: CacheVal) -> Result<(), ()> {
        if self.map.contains_key(&key) {
            return Ok(()); // at-most-one-writer: first write stands
        }
        let need = key.footprint() + val.footprint();
        if need > self.byte_budget {
            return Err(());
        }
        while self.bytes + need > self.byte_budget {
            match self.order.pop_front() {
                Some(old) => {
                    if let Some(v) = self.map.remove(&old) {
                        self.bytes -= old.footprint() + v.footprint();
                    }
                }
                None => return Err(()),
            }
        }
        self.bytes += need;
        self.order.push_back(key.clone());
        self.map.insert(key, val);
        Ok(())
    }

    /// Extend a current-scope entry with newly resolved coordinates.
    /// Only the current-read scope mutates values in place.
    pub fn append_resolved(&mut self, key: &CacheKey, coords: &[(usize, u64)]) {
        if let Some(v) = self.map.get_mut(key) {
            self.bytes += coords.len() * std::mem::size_of::<(usize, u64)>();
            v.resolved.extend_from_slice(coords);
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
        self.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate entries for promotion.
    pub fn entries(&self) -> impl Iterator<Item = (&CacheKey, &CacheVal)> {
        self.map.iter()
    }
}

/// Process-shared scope behind a mutex. Readers copy the value out
/// under the lock; they observe either "absent" or the complete value.
pub struct SharedCache {
    inner: Mutex<CacheScope>,
}

impl SharedCache {
    pub fn new(byte_budget: usize) -> Self {
        SharedCache {
            inner: Mutex::new(CacheScope::new(byte_budget)),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheVal> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: CacheKey, val: CacheVal) -> Result<(), ()> {
        self.inner.lock().unwrap().insert(key, val)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Where a lookup was satisfied; feeds the cache-hit counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheHit {
    Current,
    Local,
    Shared,
}

/// The per-worker cache bundle: an owned current-read scope, an
/// optional owned local scope, and a pointer to the shared scope.
pub struct CacheIface {
    current: CacheScope,
    local: Option<CacheScope>,
    shared: Option<Arc<SharedCache>>,
}

impl CacheIface {
    pub fn new(
        current_bytes: usize,
        local_bytes: Option<usize>,
        shared: Option<Arc<SharedCache>>,
    ) -> Self {
        CacheIface {
            current: CacheScope::new(current_bytes),
            local: local_bytes.map(CacheScope::new),
            shared,
        }
    }

    /// Reset the current-read scope. Called once per read.
    pub fn next_read(&mut self) {
        self.current.clear();
    }

    /// Look a key up through the scopes in order. On a local or shared
    /// hit the value is copied into the current scope so the rest of
    /// this read hits it cheaply.
    pub fn lookup(&mut self, key: &CacheKey) -> Option<(CacheVal, CacheHit)> {
        if let Some(v) = self.current.get(key) {
            return Some((v.clone(), CacheHit::Current));
        }
        if let Some(local) = &self.local {
            if let Some(v) = local.get(key) {
                let v = v.clone();
                let _ = self.current.insert(key.clone(), v.clone());
                return Some((v, CacheHit::Local));
            }
        }
        if let Some(shared) = &self.shared {
            if let Some(v) = shared.get(key) {
                let _ = self.current.insert(key.clone(), v.clone());
                return Some((v, CacheHit::Shared));
            }
        }
        None
    }

    /// Record a freshly computed range in the current scope.
    pub fn insert_current(&mut self, key: CacheKey, val: CacheVal) -> Result<(), ()> {
        self.current.insert(key, val)
    }

    /// Attach resolved coordinates to a current-scope entry.
    pub fn add_resolved(&mut self, key: &CacheKey, coords: &[(usize, u64)]) {
        self.current.append_resolved(key, coords);
    }

    pub fn get_current(&self, key: &CacheKey) -> Option<&CacheVal> {
        self.current.get(key)
    }

    /// Promote worthwhile current entries (nonempty ranges) to the
    /// local scope, then to the shared scope. Values are copied out
    /// first; the current scope is never locked against anything.
    /// Returns the number of entries that failed to insert anywhere.
    pub fn finish_read(&mut self) -> u64 {
        let mut ooms = 0u64;
        let promotable: Vec<(CacheKey, CacheVal)> = self
            .current
            .entries()
            .filter(|(_, v)| !v.range.is_empty())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in &promotable {
            if let Some(local) = &mut self.local {
                if local.insert(k.clone(), v.clone()).is_err() {
                    ooms += 1;
                    continue;
                }
            }
        }
        if let Some(shared) = &self.shared {
            for (k, v) in promotable {
                if shared.insert(k, v).is_err() {
                    ooms += 1;
                }
            }
        }
        self.current.clear();
        ooms
    }
}
