//! Object identity cache
//!
//! Maps host entities to their script wrappers so the same node or signal
//! always surfaces as the same script object. Entries are dropped when the
//! entity is adopted into another document or the window is torn down; the
//! next `bind` then produces a fresh wrapper.

use super::listener::EventTargetKey;
use crate::runtime::Value;
use rustc_hash::FxHashMap as HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

#[derive(Default)]
pub struct ObjectIdentityCache {
    wrappers: HashMap<EventTargetKey, Value>,
    stats: IdentityStats,
}

impl ObjectIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached wrapper for `key`, creating it with `make` on a miss
    pub fn bind(&mut self, key: EventTargetKey, make: impl FnOnce() -> Value) -> Value {
        match self.lookup(&key) {
            Some(existing) => existing,
            None => self.insert(key, make()),
        }
    }

    /// Cached wrapper for `key`, counted as a hit or a miss
    pub fn lookup(&mut self, key: &EventTargetKey) -> Option<Value> {
        let found = self.wrappers.get(key).cloned();
        match found {
            Some(_) => self.stats.hits += 1,
            None => self.stats.misses += 1,
        }
        found
    }

    /// Cache `value` for `key` unless a wrapper already exists; returns the
    /// wrapper that is now cached
    pub fn insert(&mut self, key: EventTargetKey, value: Value) -> Value {
        self.wrappers.entry(key).or_insert(value).clone()
    }

    pub fn get(&self, key: &EventTargetKey) -> Option<Value> {
        self.wrappers.get(key).cloned()
    }

    /// Forget the wrapper for `key`
    pub fn invalidate(&mut self, key: &EventTargetKey) -> bool {
        let removed = self.wrappers.remove(key).is_some();
        if removed {
            self.stats.invalidations += 1;
        }
        removed
    }

    pub fn clear(&mut self) {
        self.stats.invalidations += self.wrappers.len() as u64;
        self.wrappers.clear();
    }

    pub fn len(&self) -> usize {
        self.wrappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }

    pub fn stats(&self) -> IdentityStats {
        self.stats
    }
}
