// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Metadata stores.
//!
//! A [`MetaStore`] wraps a [`MetaCache`] with the memory-side bookkeeping a
//! cache needs in an event-driven controller: miss status holding registers
//! (MSHRs) that merge concurrent fills of the same block, and a write-back
//! buffer that keeps the contents of blocks whose write-back is in flight so a
//! refill never observes stale memory.

pub mod counters;
pub mod macs;

use std::collections::HashMap;

use crate::config::CacheConfig;
use crate::config::ConfigError;
use crate::geometry::Line;
use crate::meta_cache::CacheKey;
use crate::meta_cache::CacheStats;
use crate::meta_cache::Evicted;
use crate::meta_cache::MetaCache;
use crate::port::ReqId;

/// A metadata block with a fixed in-memory representation
pub trait MetaBlock: Sized {
    fn from_line(line: Line) -> Self;

    fn as_line(&self) -> &Line;
}

/// Party interested in the completion of a fill
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Waiter {
    /// A CPU-side request needs the block
    Request(ReqId),
    /// A child block is parked until this block is verified
    Verification,
}

/// What the caller must do after asking for a fill
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FillAction {
    /// Issue a read to memory
    Send,
    /// The block's write-back is in flight, use its contents instead of memory
    FromBuffer(Line),
    /// A fill is already outstanding, the waiter has been merged into it
    Wait,
    /// Out of MSHRs or targets. The request is resumed once an MSHR retires.
    Stalled,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    #[serde(flatten)]
    pub cache: CacheStats,
    pub fills: u64,
    pub writebacks: u64,
    pub buffer_hits: u64,
    pub stalls: u64,
}

#[derive(Debug)]
struct InFlight {
    line: Line,
    outstanding: u32,
}

/// Bounded metadata cache plus fill and write-back bookkeeping
#[derive(Debug)]
pub struct MetaStore<K, V> {
    cache: MetaCache<K, V>,
    config: CacheConfig,
    mshrs: HashMap<K, Vec<Waiter>>,
    stalled: Vec<ReqId>,
    writebacks: HashMap<K, InFlight>,
    stats: StoreStats,
}

impl<K: CacheKey, V: MetaBlock> MetaStore<K, V> {
    pub fn new(name: &'static str, config: &CacheConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            cache: MetaCache::new(name, config.entries() as usize, config.assoc as usize)?,
            config: config.clone(),
            mshrs: HashMap::new(),
            stalled: Vec::new(),
            writebacks: HashMap::new(),
            stats: StoreStats::default(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            cache: self.cache.stats(),
            ..self.stats
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.cache.contains(key)
    }

    /// Lookup that counts towards hit/miss statistics
    pub fn probe(&mut self, key: &K) -> bool {
        self.cache.get(key).is_some()
    }

    pub fn peek(&self, key: &K) -> Option<&V> {
        self.cache.peek(key)
    }

    pub fn is_dirty(&self, key: &K) -> bool {
        self.cache.is_dirty(key)
    }

    /// Mutate a resident block and mark it dirty
    pub fn update(&mut self, key: &K, f: impl FnOnce(&mut V)) -> bool {
        self.cache.update(key, f)
    }

    /// Ask for `key` to be brought into the cache on behalf of `waiter`.
    ///
    /// Verification fills ignore the MSHR limits: they are issued while a
    /// child already holds an MSHR, so limiting them could deadlock a chain.
    pub fn request_fill(&mut self, key: K, waiter: Waiter) -> FillAction {
        let bypass = waiter == Waiter::Verification;

        if let Some(targets) = self.mshrs.get_mut(&key) {
            if targets.contains(&waiter) {
                return FillAction::Wait;
            }
            if bypass || targets.len() < self.config.tgts_per_mshr as usize {
                targets.push(waiter);
                return FillAction::Wait;
            }
            return self.stall(waiter);
        }

        if !bypass && self.mshrs.len() >= self.config.mshrs as usize {
            return self.stall(waiter);
        }

        self.mshrs.insert(key, vec![waiter]);
        match self.writebacks.get(&key) {
            Some(in_flight) => {
                self.stats.buffer_hits += 1;
                FillAction::FromBuffer(in_flight.line)
            }
            None => {
                self.stats.fills += 1;
                FillAction::Send
            }
        }
    }

    fn stall(&mut self, waiter: Waiter) -> FillAction {
        if let Waiter::Request(id) = waiter {
            if !self.stalled.contains(&id) {
                self.stalled.push(id);
            }
        }
        self.stats.stalls += 1;
        FillAction::Stalled
    }

    /// Retire the MSHR of `key`, returning everyone that waited on it.
    pub fn complete_fill(&mut self, key: &K) -> Vec<Waiter> {
        self.mshrs.remove(key).unwrap_or_default()
    }

    /// Requests that stalled on MSHR limits. They should re-run their lookup.
    pub fn take_stalled(&mut self) -> Vec<ReqId> {
        if self.mshrs.len() < self.config.mshrs as usize {
            std::mem::take(&mut self.stalled)
        } else {
            Vec::new()
        }
    }

    /// Install a verified block. Returns write-backs made necessary by
    /// evictions.
    pub fn install(&mut self, key: K, line: Line) -> Vec<(K, Line)> {
        let evicted = self.cache.fill(key, V::from_line(line));
        self.retire(evicted)
    }

    fn retire(&mut self, evicted: Vec<Evicted<K, V>>) -> Vec<(K, Line)> {
        evicted
            .into_iter()
            .filter(|e| e.dirty)
            .map(|e| {
                let line = *e.value.as_line();
                self.begin_writeback(e.key, line);
                (e.key, line)
            })
            .collect()
    }

    /// Record a write-back leaving for memory.
    pub fn begin_writeback(&mut self, key: K, line: Line) {
        self.stats.writebacks += 1;
        let in_flight = self.writebacks.entry(key).or_insert(InFlight {
            line,
            outstanding: 0,
        });
        in_flight.line = line;
        in_flight.outstanding += 1;
    }

    /// Memory acknowledged a write-back of `key`.
    pub fn writeback_done(&mut self, key: &K) {
        if let Some(in_flight) = self.writebacks.get_mut(key) {
            in_flight.outstanding -= 1;
            if in_flight.outstanding == 0 {
                self.writebacks.remove(key);
            }
        }
    }

    pub fn pin(&mut self, key: &K) -> bool {
        self.cache.pin(key)
    }

    pub fn unpin(&mut self, key: &K) -> Vec<(K, Line)> {
        let evicted = self.cache.unpin(key);
        self.retire(evicted)
    }

    /// Evict the least recently used unpinned block of `key`'s set, writing it
    /// back if dirty.
    pub fn evict_one(&mut self, key: &K) -> Vec<(K, Line)> {
        let evicted = self.cache.evict_one(key).into_iter().collect();
        self.retire(evicted)
    }

    /// Write back `key` if it is dirty. The block stays cached, clean.
    pub fn flush_key(&mut self, key: &K) -> Option<(K, Line)> {
        let line = *self.cache.clean(key)?.as_line();
        self.begin_writeback(*key, line);
        Some((*key, line))
    }

    /// Write back every dirty block
    pub fn flush(&mut self) -> Vec<(K, Line)> {
        self.cache
            .dirty_keys()
            .into_iter()
            .filter_map(|key| self.flush_key(&key))
            .collect()
    }

    /// Drop every unpinned block. Dirty blocks are written back first.
    pub fn invalidate(&mut self) -> Vec<(K, Line)> {
        let mut writebacks = Vec::new();
        for key in self.cache.unpinned_keys() {
            if let Some(evicted) = self.cache.invalidate(&key) {
                writebacks.extend(self.retire(vec![evicted]));
            }
        }
        writebacks
    }

    /// No fills, stalls or write-backs in flight
    pub fn is_idle(&self) -> bool {
        self.mshrs.is_empty() && self.stalled.is_empty() && self.writebacks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
