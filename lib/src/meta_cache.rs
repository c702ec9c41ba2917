// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Bounded set-associative cache shared by all metadata kinds.
//!
//! Entries carry a dirty flag, an LRU stamp and a pin count. Inserting into a
//! full set evicts the least recently used unpinned way; evicted entries are
//! handed back to the caller, which owns write-back. When every way of a set
//! is pinned the set temporarily grows past its associativity and is trimmed
//! back as soon as entries are unpinned.

use std::hash::Hash;

use crate::config::ConfigError;
use crate::geometry::BlockAddr;
use crate::geometry::NodeId;

/// Keys usable in a [`MetaCache`]
pub trait CacheKey: Copy + Eq + Hash + std::fmt::Debug {
    /// Value from which the set index is derived
    fn set_hash(&self) -> u64;
}

impl CacheKey for BlockAddr {
    fn set_hash(&self) -> u64 {
        self.line_index()
    }
}

impl CacheKey for NodeId {
    fn set_hash(&self) -> u64 {
        // Spread levels so that equal indices on different levels do not collide
        self.index ^ (self.level as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)
    }
}

/// An entry that left the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted<K, V> {
    pub key: K,
    pub value: V,
    pub dirty: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub dirty_evictions: u64,
    /// Insertions that found every way of their set pinned
    pub overflows: u64,
}

#[derive(Debug)]
struct Entry<K, V> {
    key: K,
    value: V,
    dirty: bool,
    pins: u32,
    last_used: u64,
}

#[derive(Debug)]
pub struct MetaCache<K, V> {
    sets: Vec<Vec<Entry<K, V>>>,
    assoc: usize,
    clock: u64,
    stats: CacheStats,
}

impl<K: CacheKey, V> MetaCache<K, V> {
    /// Create a cache of `entries` blocks organised in `assoc`-way sets.
    pub fn new(name: &'static str, entries: usize, assoc: usize) -> Result<Self, ConfigError> {
        if assoc == 0 || entries == 0 || entries % assoc != 0 {
            return Err(ConfigError::Cache {
                name,
                reason: format!("{entries} entries cannot form {assoc}-way sets"),
            });
        }
        let sets = (0..entries / assoc)
            .map(|_| Vec::with_capacity(assoc))
            .collect();
        Ok(Self {
            sets,
            assoc,
            clock: 0,
            stats: CacheStats::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.sets.len() * self.assoc
    }

    pub fn len(&self) -> usize {
        self.sets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.iter().all(Vec::is_empty)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn set_of(&self, key: &K) -> usize {
        (key.set_hash() % self.sets.len() as u64) as usize
    }

    fn position(&self, key: &K) -> (usize, Option<usize>) {
        let set = self.set_of(key);
        (set, self.sets[set].iter().position(|e| e.key == *key))
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn contains(&self, key: &K) -> bool {
        self.position(key).1.is_some()
    }

    /// Look a key up without touching recency or statistics.
    pub fn peek(&self, key: &K) -> Option<&V> {
        match self.position(key) {
            (set, Some(way)) => Some(&self.sets[set][way].value),
            _ => None,
        }
    }

    /// Look a key up, counting a hit or a miss and refreshing recency.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        match self.position(key) {
            (set, Some(way)) => {
                self.stats.hits += 1;
                let now = self.tick();
                let entry = &mut self.sets[set][way];
                entry.last_used = now;
                Some(&entry.value)
            }
            _ => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn is_dirty(&self, key: &K) -> bool {
        match self.position(key) {
            (set, Some(way)) => self.sets[set][way].dirty,
            _ => false,
        }
    }

    /// Mutate a resident entry in place and mark it dirty. Returns `false`
    /// if the key is not resident.
    pub fn update(&mut self, key: &K, f: impl FnOnce(&mut V)) -> bool {
        match self.position(key) {
            (set, Some(way)) => {
                let now = self.tick();
                let entry = &mut self.sets[set][way];
                f(&mut entry.value);
                entry.dirty = true;
                entry.last_used = now;
                true
            }
            _ => false,
        }
    }

    /// Store a value and mark it dirty.
    pub fn put(&mut self, key: K, value: V) -> Vec<Evicted<K, V>> {
        self.insert(key, value, true)
    }

    /// Install a value fetched from memory. The entry starts clean.
    pub fn fill(&mut self, key: K, value: V) -> Vec<Evicted<K, V>> {
        self.insert(key, value, false)
    }

    fn insert(&mut self, key: K, value: V, dirty: bool) -> Vec<Evicted<K, V>> {
        let now = self.tick();
        let (set, way) = self.position(&key);

        if let Some(way) = way {
            let entry = &mut self.sets[set][way];
            entry.value = value;
            entry.dirty |= dirty;
            entry.last_used = now;
            return Vec::new();
        }

        let mut evicted = Vec::new();
        if self.sets[set].len() >= self.assoc {
            match self.evict_from(set) {
                Some(victim) => evicted.push(victim),
                None => self.stats.overflows += 1,
            }
        }

        self.sets[set].push(Entry {
            key,
            value,
            dirty,
            pins: 0,
            last_used: now,
        });
        evicted
    }

    fn evict_from(&mut self, set: usize) -> Option<Evicted<K, V>> {
        let way = self.sets[set]
            .iter()
            .enumerate()
            .filter(|(_, e)| e.pins == 0)
            .min_by_key(|(_, e)| e.last_used)
            .map(|(way, _)| way)?;

        let entry = self.sets[set].swap_remove(way);
        self.stats.evictions += 1;
        if entry.dirty {
            self.stats.dirty_evictions += 1;
        }
        Some(Evicted {
            key: entry.key,
            value: entry.value,
            dirty: entry.dirty,
        })
    }

    /// Evict the least recently used unpinned entry from the set `key` maps to.
    pub fn evict_one(&mut self, key: &K) -> Option<Evicted<K, V>> {
        let set = self.set_of(key);
        self.evict_from(set)
    }

    /// Protect a resident entry from eviction. Returns `false` if not resident.
    pub fn pin(&mut self, key: &K) -> bool {
        match self.position(key) {
            (set, Some(way)) => {
                self.sets[set][way].pins += 1;
                true
            }
            _ => false,
        }
    }

    /// Drop one pin. If the entry's set is over capacity, it is trimmed and the
    /// trimmed entries are returned.
    pub fn unpin(&mut self, key: &K) -> Vec<Evicted<K, V>> {
        let (set, way) = self.position(key);
        if let Some(way) = way {
            let entry = &mut self.sets[set][way];
            entry.pins = entry.pins.saturating_sub(1);
        }

        let mut evicted = Vec::new();
        while self.sets[set].len() > self.assoc {
            match self.evict_from(set) {
                Some(victim) => evicted.push(victim),
                None => break,
            }
        }
        evicted
    }

    /// Remove an unpinned entry regardless of recency.
    pub fn invalidate(&mut self, key: &K) -> Option<Evicted<K, V>> {
        let (set, way) = self.position(key);
        let way = way.filter(|&way| self.sets[set][way].pins == 0)?;
        let entry = self.sets[set].swap_remove(way);
        Some(Evicted {
            key: entry.key,
            value: entry.value,
            dirty: entry.dirty,
        })
    }

    /// Keys of all dirty entries
    pub fn dirty_keys(&self) -> Vec<K> {
        self.sets
            .iter()
            .flatten()
            .filter(|e| e.dirty)
            .map(|e| e.key)
            .collect()
    }

    /// Keys of all unpinned entries
    pub fn unpinned_keys(&self) -> Vec<K> {
        self.sets
            .iter()
            .flatten()
            .filter(|e| e.pins == 0)
            .map(|e| e.key)
            .collect()
    }

    /// Mark an entry clean, returning its value if it was dirty.
    pub fn clean(&mut self, key: &K) -> Option<&V> {
        match self.position(key) {
            (set, Some(way)) => {
                let entry = &mut self.sets[set][way];
                if entry.dirty {
                    entry.dirty = false;
                    Some(&entry.value)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}
