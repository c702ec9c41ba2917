// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Layout of the protected data and its metadata in main memory.
//!
//! Main memory is a single flat address space laid out as
//!
//! ```text
//! | data lines | counter blocks | MAC blocks | tree level 0 | ... | top node |
//! ```
//!
//! Every region is line-granular. Counter blocks are the leaves of the
//! integrity tree: level-0 nodes hold one digest slot per counter block,
//! level-k nodes one slot per level-(k-1) node. The single top node is
//! anchored by the on-chip root digest.

use std::ops::Range;

use crate::config::ConfigError;
use crate::config::SecCtrlConfig;

/// Size of a memory line in bytes
pub const LINE_BYTES: usize = 64;

/// Contents of one memory line
pub type Line = [u8; LINE_BYTES];

/// Line-aligned memory address
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct BlockAddr(u64);

impl BlockAddr {
    /// Wrap an address, failing if it is not line-aligned.
    pub const fn new(addr: u64) -> Option<Self> {
        if addr % LINE_BYTES as u64 == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Address of the line with the given index.
    pub const fn from_line_index(index: u64) -> Self {
        Self(index * LINE_BYTES as u64)
    }

    /// Raw byte address
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Line number in the flat address space
    pub const fn line_index(self) -> u64 {
        self.0 / LINE_BYTES as u64
    }
}

impl std::fmt::Debug for BlockAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl std::fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Position of a node in the integrity tree. Level 0 sits right above the
/// counter blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub level: u8,
    pub index: u64,
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}#{}", self.level, self.index)
    }
}

/// Kind of metadata held in a metadata block
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum MetaKind {
    Counter,
    Mac,
    Tree,
}

/// Identity of a metadata block
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MetaKey {
    Counter(BlockAddr),
    Mac(BlockAddr),
    Node(NodeId),
}

impl MetaKey {
    pub fn kind(&self) -> MetaKind {
        match self {
            Self::Counter(_) => MetaKind::Counter,
            Self::Mac(_) => MetaKind::Mac,
            Self::Node(_) => MetaKind::Tree,
        }
    }
}

impl std::fmt::Display for MetaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Counter(addr) => write!(f, "counter block {addr}"),
            Self::Mac(addr) => write!(f, "MAC block {addr}"),
            Self::Node(node) => write!(f, "tree node {node}"),
        }
    }
}

/// Where a block's digest is checked
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Anchor {
    /// Slot `slot` of node `parent`
    Slot { parent: NodeId, slot: usize },
    /// The on-chip root
    Root,
}

/// Region of the flat address space an address falls in
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum Region {
    Data,
    Counter,
    Mac,
    Tree,
}

/// Derived memory layout
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    data_lines: u64,
    counters_per_block: u64,
    counter_bytes: usize,
    counter_blocks: u64,
    tags_per_block: u64,
    tag_bytes: usize,
    mac_blocks: u64,
    arity: u64,
    /// Node count per tree level, level 0 first. The last level has one node.
    level_nodes: Vec<u64>,
    /// Line offset of each level within the tree region
    level_offsets: Vec<u64>,
    counter_base: u64,
    mac_base: u64,
    tree_base: u64,
    end: u64,
}

impl Geometry {
    pub fn new(config: &SecCtrlConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let line = LINE_BYTES as u64;
        let data_lines = config.data_bytes / line;
        let counters_per_block = (LINE_BYTES * 8) as u64 / config.counter_bits as u64;
        let counter_blocks = data_lines.div_ceil(counters_per_block);
        let tags_per_block = (LINE_BYTES * 8) as u64 / config.tag_bits as u64;
        let mac_blocks = data_lines.div_ceil(tags_per_block);
        let arity = config.tree_arity as u64;

        let mut level_nodes = vec![counter_blocks.div_ceil(arity)];
        while let Some(&nodes) = level_nodes.last() {
            if nodes <= 1 {
                break;
            }
            level_nodes.push(nodes.div_ceil(arity));
        }
        let mut level_offsets = Vec::with_capacity(level_nodes.len());
        let mut offset = 0;
        for nodes in &level_nodes {
            level_offsets.push(offset);
            offset += nodes;
        }

        let counter_base = config.data_bytes;
        let mac_base = counter_base + counter_blocks * line;
        let tree_base = mac_base + mac_blocks * line;
        let end = tree_base + offset * line;

        Ok(Self {
            data_lines,
            counters_per_block,
            counter_bytes: config.counter_bits as usize / 8,
            counter_blocks,
            tags_per_block,
            tag_bytes: config.tag_bits as usize / 8,
            mac_blocks,
            arity,
            level_nodes,
            level_offsets,
            counter_base,
            mac_base,
            tree_base,
            end,
        })
    }

    /// Protected data range, as advertised on the CPU side
    pub fn data_range(&self) -> Range<u64> {
        0..self.counter_base
    }

    /// Whole backing address space including metadata
    pub fn memory_range(&self) -> Range<u64> {
        0..self.end
    }

    pub fn data_lines(&self) -> u64 {
        self.data_lines
    }

    pub fn counter_blocks(&self) -> u64 {
        self.counter_blocks
    }

    pub fn mac_blocks(&self) -> u64 {
        self.mac_blocks
    }

    pub fn counter_bytes(&self) -> usize {
        self.counter_bytes
    }

    pub fn tag_bytes(&self) -> usize {
        self.tag_bytes
    }

    pub fn arity(&self) -> usize {
        self.arity as usize
    }

    /// Width of a digest slot inside a tree node
    pub fn slot_bytes(&self) -> usize {
        LINE_BYTES / self.arity as usize
    }

    /// Number of tree levels including the top node's
    pub fn levels(&self) -> usize {
        self.level_nodes.len()
    }

    pub fn nodes_at(&self, level: u8) -> u64 {
        self.level_nodes.get(level as usize).copied().unwrap_or(0)
    }

    /// The single node anchored by the on-chip root
    pub fn top(&self) -> NodeId {
        NodeId {
            level: (self.level_nodes.len() - 1) as u8,
            index: 0,
        }
    }

    /// Region an address falls in
    pub fn region_of(&self, addr: u64) -> Option<Region> {
        match addr {
            a if a < self.counter_base => Some(Region::Data),
            a if a < self.mac_base => Some(Region::Counter),
            a if a < self.tree_base => Some(Region::Mac),
            a if a < self.end => Some(Region::Tree),
            _ => None,
        }
    }

    /// Counter block holding the counter of `data`, and the slot within it
    pub fn counter_slot(&self, data: BlockAddr) -> (BlockAddr, usize) {
        let line = data.line_index();
        let block = line / self.counters_per_block;
        (
            BlockAddr(self.counter_base + block * LINE_BYTES as u64),
            (line % self.counters_per_block) as usize,
        )
    }

    /// MAC block holding the tag of `data`, and the slot within it
    pub fn mac_slot(&self, data: BlockAddr) -> (BlockAddr, usize) {
        let line = data.line_index();
        let block = line / self.tags_per_block;
        (
            BlockAddr(self.mac_base + block * LINE_BYTES as u64),
            (line % self.tags_per_block) as usize,
        )
    }

    /// Index of a counter block among all counter blocks
    pub fn counter_block_index(&self, block: BlockAddr) -> u64 {
        (block.get() - self.counter_base) / LINE_BYTES as u64
    }

    pub fn counter_block_addr(&self, index: u64) -> BlockAddr {
        BlockAddr(self.counter_base + index * LINE_BYTES as u64)
    }

    pub fn mac_block_addr(&self, index: u64) -> BlockAddr {
        BlockAddr(self.mac_base + index * LINE_BYTES as u64)
    }

    /// Memory address of a tree node
    pub fn node_addr(&self, node: NodeId) -> BlockAddr {
        let offset = self.level_offsets[node.level as usize] + node.index;
        BlockAddr(self.tree_base + offset * LINE_BYTES as u64)
    }

    /// Memory address of any metadata block
    pub fn meta_addr(&self, key: MetaKey) -> BlockAddr {
        match key {
            MetaKey::Counter(addr) | MetaKey::Mac(addr) => addr,
            MetaKey::Node(node) => self.node_addr(node),
        }
    }

    /// Where the digest of a counter block or tree node is held
    pub fn anchor_of(&self, key: MetaKey) -> Option<Anchor> {
        match key {
            MetaKey::Counter(addr) => {
                let index = self.counter_block_index(addr);
                Some(Anchor::Slot {
                    parent: NodeId {
                        level: 0,
                        index: index / self.arity,
                    },
                    slot: (index % self.arity) as usize,
                })
            }
            MetaKey::Node(node) if node == self.top() => Some(Anchor::Root),
            MetaKey::Node(node) => Some(Anchor::Slot {
                parent: NodeId {
                    level: node.level + 1,
                    index: node.index / self.arity,
                },
                slot: (node.index % self.arity) as usize,
            }),
            MetaKey::Mac(_) => None,
        }
    }

    /// Tree nodes from the leaf group of `counter_block` up to the top node
    pub fn path(&self, counter_block: BlockAddr) -> Vec<NodeId> {
        let mut index = self.counter_block_index(counter_block);
        (0..self.level_nodes.len())
            .map(|level| {
                index /= self.arity;
                NodeId {
                    level: level as u8,
                    index,
                }
            })
            .collect()
    }

    /// Keys of the children covered by `node`, in slot order
    pub fn children(&self, node: NodeId) -> Vec<MetaKey> {
        let first = node.index * self.arity;
        if node.level == 0 {
            let end = (first + self.arity).min(self.counter_blocks);
            (first..end)
                .map(|i| MetaKey::Counter(self.counter_block_addr(i)))
                .collect()
        } else {
            let level = node.level - 1;
            let end = (first + self.arity).min(self.nodes_at(level));
            (first..end)
                .map(|index| MetaKey::Node(NodeId { level, index }))
                .collect()
        }
    }
}
