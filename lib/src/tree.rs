// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Merkle tree over the counter blocks.
//!
//! Every node is one line holding `arity` truncated digests of its children.
//! Counter blocks are the leaves. The digest of the single top node is the
//! root, which never leaves the chip. Nodes live in a bounded cache; a node
//! in the cache has been verified and is trusted, so verification of a
//! fetched block only has to walk up until it meets a cached ancestor.

use thiserror::Error;

use crate::config::CacheConfig;
use crate::config::ConfigError;
use crate::fault::Cause;
use crate::geometry::Anchor;
use crate::geometry::BlockAddr;
use crate::geometry::Geometry;
use crate::geometry::Line;
use crate::geometry::MetaKey;
use crate::geometry::NodeId;
use crate::geometry::LINE_BYTES;
use crate::hash::Digest;
use crate::metadata::MetaBlock;
use crate::metadata::MetaStore;

const LEAF_DOMAIN: u8 = 0x01;
const NODE_DOMAIN: u8 = 0x02;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeError {
    #[error("Tree node {0} is not resident")]
    NotResident(NodeId),

    #[error("{0} is not covered by the tree")]
    NotCovered(MetaKey),
}

/// Digest of a counter block, bound to its position
pub fn leaf_digest(index: u64, line: &Line) -> Digest {
    Digest::of_parts([
        [LEAF_DOMAIN].as_slice(),
        index.to_le_bytes().as_slice(),
        line.as_slice(),
    ])
}

/// Digest of a tree node, bound to its position
pub fn node_digest(node: NodeId, line: &Line) -> Digest {
    Digest::of_parts([
        [NODE_DOMAIN, node.level].as_slice(),
        node.index.to_le_bytes().as_slice(),
        line.as_slice(),
    ])
}

/// A tree node: `arity` digest slots of `LINE_BYTES / arity` bytes each
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeBlock(Line);

impl NodeBlock {
    pub fn slot(&self, slot: usize, width: usize) -> &[u8] {
        &self.0[slot * width..(slot + 1) * width]
    }

    pub fn set_slot(&mut self, slot: usize, width: usize, digest: &Digest) {
        self.0[slot * width..(slot + 1) * width].copy_from_slice(digest.truncated(width));
    }
}

impl MetaBlock for NodeBlock {
    fn from_line(line: Line) -> Self {
        Self(line)
    }

    fn as_line(&self) -> &Line {
        &self.0
    }
}

/// Outcome of checking a fetched block against the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathCheck {
    /// Matches its anchor. Safe to cache.
    Verified,
    /// The anchoring node is not cached and must be fetched and verified first
    Pending(NodeId),
    /// Does not match its anchor
    Violation(Cause),
}

/// Tree contents computed from scratch
#[derive(Debug, Clone)]
pub struct BuiltTree {
    pub nodes: Vec<(NodeId, Line)>,
    pub root: Digest,
}

/// Compute every node and the root from the counter blocks returned by
/// `leaf_source`.
pub fn build(geo: &Geometry, mut leaf_source: impl FnMut(BlockAddr) -> Line) -> BuiltTree {
    let width = geo.slot_bytes();
    let mut digests: Vec<Digest> = (0..geo.counter_blocks())
        .map(|i| leaf_digest(i, &leaf_source(geo.counter_block_addr(i))))
        .collect();
    let mut nodes = Vec::new();

    for level in 0..geo.levels() as u8 {
        let mut next = Vec::with_capacity(geo.nodes_at(level) as usize);
        for (index, children) in digests.chunks(geo.arity()).enumerate() {
            let mut line = [0u8; LINE_BYTES];
            for (slot, digest) in children.iter().enumerate() {
                line[slot * width..(slot + 1) * width].copy_from_slice(digest.truncated(width));
            }
            let node = NodeId {
                level,
                index: index as u64,
            };
            next.push(node_digest(node, &line));
            nodes.push((node, line));
        }
        digests = next;
    }

    // The last level has exactly one node
    let root = digests
        .first()
        .copied()
        .unwrap_or_else(|| Digest::of_parts([[NODE_DOMAIN]]));
    BuiltTree { nodes, root }
}

/// Integrity tree with its node cache and the trusted root
#[derive(Debug)]
pub struct IntegrityTree {
    geo: Geometry,
    store: MetaStore<NodeId, NodeBlock>,
    root: Digest,
}

impl IntegrityTree {
    pub fn new(geo: &Geometry, config: &CacheConfig, root: Digest) -> Result<Self, ConfigError> {
        Ok(Self {
            geo: geo.clone(),
            store: MetaStore::new("tree", config)?,
            root,
        })
    }

    /// The on-chip root
    pub fn root(&self) -> Digest {
        self.root
    }

    pub fn store(&self) -> &MetaStore<NodeId, NodeBlock> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MetaStore<NodeId, NodeBlock> {
        &mut self.store
    }

    fn digest_of(&self, key: MetaKey, line: &Line) -> Result<Digest, TreeError> {
        match key {
            MetaKey::Counter(addr) => Ok(leaf_digest(self.geo.counter_block_index(addr), line)),
            MetaKey::Node(node) => Ok(node_digest(node, line)),
            MetaKey::Mac(_) => Err(TreeError::NotCovered(key)),
        }
    }

    /// Check a fetched counter block or node against its anchor. MAC blocks
    /// are not covered by the tree and always pass.
    pub fn check(&self, key: MetaKey, line: &Line) -> PathCheck {
        let Some(anchor) = self.geo.anchor_of(key) else {
            return PathCheck::Verified;
        };
        let Ok(digest) = self.digest_of(key, line) else {
            return PathCheck::Verified;
        };

        match anchor {
            Anchor::Root if digest == self.root => PathCheck::Verified,
            Anchor::Root => PathCheck::Violation(Cause::RootMismatch),
            Anchor::Slot { parent, slot } => match self.store.peek(&parent) {
                None => PathCheck::Pending(parent),
                Some(block) => {
                    let width = self.geo.slot_bytes();
                    if block.slot(slot, width) == digest.truncated(width) {
                        PathCheck::Verified
                    } else {
                        PathCheck::Violation(Cause::DigestMismatch)
                    }
                }
            },
        }
    }

    /// Check a fetched counter block against the tree
    pub fn verify_path(&self, counter_block: BlockAddr, line: &Line) -> PathCheck {
        self.check(MetaKey::Counter(counter_block), line)
    }

    /// Whether every node from `counter_block`'s leaf group up to the top is cached
    pub fn path_resident(&self, counter_block: BlockAddr) -> bool {
        self.geo
            .path(counter_block)
            .iter()
            .all(|node| self.store.contains(node))
    }

    /// Propagate the new contents of a counter block up to the root.
    ///
    /// Every node on the path must be cached. Nothing is modified otherwise.
    /// Updated nodes are marked dirty. Returns the new root.
    pub fn update_path(&mut self, counter_block: BlockAddr, leaf: &Line) -> Result<Digest, TreeError> {
        let path = self.geo.path(counter_block);
        if let Some(missing) = path.iter().find(|node| !self.store.contains(node)) {
            return Err(TreeError::NotResident(*missing));
        }

        let arity = self.geo.arity() as u64;
        let width = self.geo.slot_bytes();
        let mut index = self.geo.counter_block_index(counter_block);
        let mut digest = leaf_digest(index, leaf);

        for node in path {
            let slot = (index % arity) as usize;
            let mut line = [0u8; LINE_BYTES];
            self.store.update(&node, |block| {
                block.set_slot(slot, width, &digest);
                line = *block.as_line();
            });
            digest = node_digest(node, &line);
            index = node.index;
        }

        self.root = digest;
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecCtrlConfig;

    fn setup(arity: u32) -> (Geometry, CacheConfig) {
        let config = SecCtrlConfig {
            data_bytes: 64 * 1024,
            tree_arity: arity,
            ..SecCtrlConfig::default()
        };
        (Geometry::new(&config).unwrap(), config.tree_cache)
    }

    fn counter_line(i: u64) -> Line {
        let mut line = [0u8; 64];
        line[..8].copy_from_slice(&i.to_le_bytes());
        line
    }

    /// A tree whose cache holds every node of `built`
    fn warm(geo: &Geometry, config: &CacheConfig, built: &BuiltTree) -> IntegrityTree {
        let mut tree = IntegrityTree::new(geo, config, built.root).unwrap();
        for (node, line) in &built.nodes {
            tree.store_mut().install(*node, *line);
        }
        tree
    }

    #[test]
    fn built_tree_verifies_its_leaves() {
        let (geo, config) = setup(4);
        let built = build(&geo, |addr| counter_line(geo.counter_block_index(addr)));
        assert_eq!(
            built.nodes.len() as u64,
            (0..geo.levels() as u8).map(|l| geo.nodes_at(l)).sum::<u64>()
        );

        let cold = IntegrityTree::new(&geo, &config, built.root).unwrap();
        let block = geo.counter_block_addr(9);
        let leaf_parent = geo.path(block)[0];
        assert_eq!(cold.verify_path(block, &counter_line(9)), PathCheck::Pending(leaf_parent));

        let (top, top_line) = built.nodes.last().unwrap();
        assert_eq!(*top, geo.top());
        assert_eq!(cold.check(MetaKey::Node(*top), top_line), PathCheck::Verified);
        let mut tampered = *top_line;
        tampered[0] ^= 0x80;
        assert_eq!(
            cold.check(MetaKey::Node(*top), &tampered),
            PathCheck::Violation(Cause::RootMismatch)
        );

        let tree = warm(&geo, &config, &built);
        assert_eq!(tree.verify_path(block, &counter_line(9)), PathCheck::Verified);
        assert_eq!(
            tree.verify_path(block, &counter_line(10)),
            PathCheck::Violation(Cause::DigestMismatch)
        );
    }

    #[test]
    fn update_matches_rebuild() {
        for arity in [2, 4, 8] {
            let (geo, config) = setup(arity);
            let built = build(&geo, |_| [0; 64]);
            let mut tree = warm(&geo, &config, &built);

            let block = geo.counter_block_addr(geo.counter_blocks() - 1);
            let root = tree.update_path(block, &counter_line(5)).unwrap();
            assert_ne!(root, built.root);

            let rebuilt = build(&geo, |addr| {
                if addr == block {
                    counter_line(5)
                } else {
                    [0; 64]
                }
            });
            assert_eq!(root, rebuilt.root, "arity {arity}");
            assert_eq!(tree.root(), rebuilt.root);
            for node in geo.path(block) {
                assert!(tree.store().is_dirty(&node));
            }
        }
    }

    #[test]
    fn update_requires_resident_path() {
        let (geo, config) = setup(8);
        let built = build(&geo, |_| [0; 64]);
        let mut tree = IntegrityTree::new(&geo, &config, built.root).unwrap();
        let block = geo.counter_block_addr(0);
        let top = geo.top();
        let top_line = built.nodes.iter().find(|(n, _)| *n == top).unwrap().1;
        tree.store_mut().install(top, top_line);

        assert!(!tree.path_resident(block));
        assert_eq!(
            tree.update_path(block, &[1; 64]),
            Err(TreeError::NotResident(geo.path(block)[0]))
        );
        assert_eq!(tree.root(), built.root);
        assert!(!tree.store().is_dirty(&top));
    }

    #[test]
    fn digests_are_position_bound() {
        let line = [7; 64];
        assert_ne!(leaf_digest(0, &line), leaf_digest(1, &line));
        assert_ne!(
            node_digest(NodeId { level: 0, index: 0 }, &line),
            node_digest(NodeId { level: 1, index: 0 }, &line)
        );
        assert_ne!(leaf_digest(0, &line), node_digest(NodeId { level: 0, index: 0 }, &line));
    }
}
