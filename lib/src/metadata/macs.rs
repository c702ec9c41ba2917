// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Per-line authentication tags

use crate::config::CacheConfig;
use crate::config::ConfigError;
use crate::crypto::Tag;
use crate::geometry::BlockAddr;
use crate::geometry::Geometry;
use crate::geometry::Line;
use crate::metadata::MetaBlock;
use crate::metadata::MetaStore;

/// A line of tags, `width` bytes each
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacBlock(Line);

impl MacBlock {
    pub fn tag(&self, slot: usize, width: usize) -> Tag {
        Tag::from_slice(&self.0[slot * width..(slot + 1) * width])
    }

    pub fn set_tag(&mut self, slot: usize, tag: &Tag) {
        let bytes = tag.as_bytes();
        let start = slot * bytes.len();
        self.0[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

impl MetaBlock for MacBlock {
    fn from_line(line: Line) -> Self {
        Self(line)
    }

    fn as_line(&self) -> &Line {
        &self.0
    }
}

/// MAC cache addressed by data line
#[derive(Debug)]
pub struct MacStore {
    geo: Geometry,
    store: MetaStore<BlockAddr, MacBlock>,
}

impl MacStore {
    pub fn new(geo: &Geometry, config: &CacheConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            geo: geo.clone(),
            store: MetaStore::new("mac", config)?,
        })
    }

    pub fn get(&self, addr: BlockAddr) -> Option<Tag> {
        let (block, slot) = self.geo.mac_slot(addr);
        self.store
            .peek(&block)
            .map(|b| b.tag(slot, self.geo.tag_bytes()))
    }

    /// Store the tag of `addr`, marking its block dirty. Returns `false` if
    /// the block is not cached.
    pub fn put(&mut self, addr: BlockAddr, tag: &Tag) -> bool {
        let (block, slot) = self.geo.mac_slot(addr);
        self.store.update(&block, |b| b.set_tag(slot, tag))
    }

    /// Evict the least recently used unpinned block that shares a set with
    /// the MAC block of `addr`. A returned write-back is in flight and must be
    /// sent by the caller.
    pub fn evict_one(&mut self, addr: BlockAddr) -> Option<(BlockAddr, Line)> {
        let (block, _) = self.geo.mac_slot(addr);
        self.store.evict_one(&block).pop()
    }

    pub fn store(&self) -> &MetaStore<BlockAddr, MacBlock> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MetaStore<BlockAddr, MacBlock> {
        &mut self.store
    }
}
