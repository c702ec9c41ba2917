// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Per-line encryption counters

use crate::config::CacheConfig;
use crate::config::ConfigError;
use crate::geometry::BlockAddr;
use crate::geometry::Geometry;
use crate::geometry::Line;
use crate::metadata::MetaBlock;
use crate::metadata::MetaStore;

/// A line of little-endian counters, `width` bytes each
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterBlock(Line);

impl CounterBlock {
    pub fn counter(&self, slot: usize, width: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[..width].copy_from_slice(&self.0[slot * width..(slot + 1) * width]);
        u64::from_le_bytes(bytes)
    }

    pub fn set_counter(&mut self, slot: usize, width: usize, value: u64) {
        self.0[slot * width..(slot + 1) * width].copy_from_slice(&value.to_le_bytes()[..width]);
    }
}

impl MetaBlock for CounterBlock {
    fn from_line(line: Line) -> Self {
        Self(line)
    }

    fn as_line(&self) -> &Line {
        &self.0
    }
}

/// Counter cache addressed by data line
#[derive(Debug)]
pub struct CounterStore {
    geo: Geometry,
    store: MetaStore<BlockAddr, CounterBlock>,
}

impl CounterStore {
    pub fn new(geo: &Geometry, config: &CacheConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            geo: geo.clone(),
            store: MetaStore::new("counter", config)?,
        })
    }

    /// Counter of the data line `addr`, or `None` if its block is not cached
    pub fn get(&self, addr: BlockAddr) -> Option<u64> {
        let (block, slot) = self.geo.counter_slot(addr);
        self.store
            .peek(&block)
            .map(|b| b.counter(slot, self.geo.counter_bytes()))
    }

    /// Set the counter of the data line `addr`, marking its block dirty.
    /// Returns `false` if the block is not cached.
    pub fn put(&mut self, addr: BlockAddr, value: u64) -> bool {
        let (block, slot) = self.geo.counter_slot(addr);
        let width = self.geo.counter_bytes();
        self.store
            .update(&block, |b| b.set_counter(slot, width, value))
    }

    /// Evict the least recently used unpinned block that shares a set with
    /// the counter block of `addr`. Returns the write-back, if the victim was
    /// dirty. It is registered as in flight, so the caller must send it; the
    /// controller does so in [`SecCtrl::evict_metadata`].
    ///
    /// [`SecCtrl::evict_metadata`]: crate::controller::SecCtrl::evict_metadata
    pub fn evict_one(&mut self, addr: BlockAddr) -> Option<(BlockAddr, Line)> {
        let (block, _) = self.geo.counter_slot(addr);
        self.store.evict_one(&block).pop()
    }

    /// Contents of the counter block holding `addr`'s counter
    pub fn block_line(&self, addr: BlockAddr) -> Option<Line> {
        let (block, _) = self.geo.counter_slot(addr);
        self.store.peek(&block).map(|b| *b.as_line())
    }

    pub fn store(&self) -> &MetaStore<BlockAddr, CounterBlock> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MetaStore<BlockAddr, CounterBlock> {
        &mut self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecCtrlConfig;

    #[test]
    fn counters_pack_by_width() {
        let mut block = CounterBlock::from_line([0; 64]);
        block.set_counter(3, 2, 0xbeef);
        block.set_counter(4, 2, 0x1_0001);
        assert_eq!(block.counter(3, 2), 0xbeef);
        // Truncated to the slot width
        assert_eq!(block.counter(4, 2), 1);
        assert_eq!(&block.as_line()[6..10], &[0xef, 0xbe, 0x01, 0x00]);
    }

    #[test]
    fn get_misses_until_installed() {
        let config = SecCtrlConfig {
            data_bytes: 64 * 64,
            counter_bits: 32,
            ..SecCtrlConfig::default()
        };
        let geo = Geometry::new(&config).unwrap();
        let mut counters = CounterStore::new(&geo, &config.counter_cache).unwrap();
        let line = BlockAddr::from_line_index(20);
        assert_eq!(counters.get(line), None);
        assert!(!counters.put(line, 1));

        let (block, _) = geo.counter_slot(line);
        counters.store_mut().install(block, [0; 64]);
        assert_eq!(counters.get(line), Some(0));
        assert!(counters.put(line, 7));
        assert_eq!(counters.get(line), Some(7));
        assert_eq!(counters.get(BlockAddr::from_line_index(21)), Some(0));
        assert!(counters.store().is_dirty(&block));

        assert_eq!(counters.evict_one(line), Some((block, counters_line(7))));
        assert_eq!(counters.get(line), None);
    }

    fn counters_line(slot4: u32) -> Line {
        // Line 20 is slot 4 of its block with 16 counters per block
        let mut line = [0; 64];
        line[16..20].copy_from_slice(&slot4.to_le_bytes());
        line
    }
}
