// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Memory images and offline provisioning.
//!
//! Provisioning formats a fresh image: every data line holds the encryption
//! of an all-zero line under counter 0, its tag is in place, and the tree is
//! built over the all-zero counter blocks. The resulting root is what the
//! controller is instantiated with.

use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::config::SecCtrlConfig;
use crate::crypto::CryptoError;
use crate::crypto::CryptoUnit;
use crate::crypto::Nonce;
use crate::geometry::BlockAddr;
use crate::geometry::Geometry;
use crate::geometry::Line;
use crate::geometry::LINE_BYTES;
use crate::hash::Digest;
use crate::metadata::macs::MacBlock;
use crate::metadata::MetaBlock;
use crate::tree;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Image I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Contents of the whole backing address space
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryImage {
    bytes: Vec<u8>,
}

impl MemoryImage {
    pub fn zeroed(size: u64) -> Self {
        Self {
            bytes: vec![0; size as usize],
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn range(&self, addr: BlockAddr) -> Option<std::ops::Range<usize>> {
        let start = addr.get() as usize;
        let end = start.checked_add(LINE_BYTES)?;
        (end <= self.bytes.len()).then_some(start..end)
    }

    pub fn read_line(&self, addr: BlockAddr) -> Option<Line> {
        let range = self.range(addr)?;
        self.bytes[range].try_into().ok()
    }

    /// Returns `false` if the line is outside the image.
    pub fn write_line(&mut self, addr: BlockAddr, line: &Line) -> bool {
        match self.range(addr) {
            Some(range) => {
                self.bytes[range].copy_from_slice(line);
                true
            }
            None => false,
        }
    }

    /// Flip bit `bit` (0 to 7) of the byte at `addr`.
    pub fn flip_bit(&mut self, addr: u64, bit: u8) -> bool {
        match self.bytes.get_mut(addr as usize) {
            Some(byte) => {
                *byte ^= 1 << (bit % 8);
                true
            }
            None => false,
        }
    }

    /// Root of the tree rebuilt from the counter blocks in this image
    pub fn tree_root(&self, geo: &Geometry) -> Digest {
        tree::build(geo, |addr| self.read_line(addr).unwrap_or([0; LINE_BYTES])).root
    }
}

impl std::fmt::Debug for MemoryImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryImage")
            .field("size", &self.bytes.len())
            .finish()
    }
}

/// A freshly formatted image together with the root anchoring it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provisioned {
    pub root: Digest,
    pub image: MemoryImage,
}

impl Provisioned {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        let file = std::io::BufWriter::new(std::fs::File::create(path)?);
        bincode::serialize_into(file, self)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let file = std::io::BufReader::new(std::fs::File::open(path)?);
        Ok(bincode::deserialize_from(file)?)
    }
}

/// Format a fresh memory image for `config`.
pub fn provision(config: &SecCtrlConfig) -> Result<Provisioned, ImageError> {
    let geo = Geometry::new(config)?;
    let crypto = CryptoUnit::new(&config.keys, geo.tag_bytes());
    let mut image = MemoryImage::zeroed(geo.memory_range().end);

    let mut macs = vec![MacBlock::from_line([0; LINE_BYTES]); geo.mac_blocks() as usize];
    for line in 0..geo.data_lines() {
        let addr = BlockAddr::from_line_index(line);
        let nonce = Nonce::new(addr, 0);
        let ciphertext = crypto.encrypt(&[0; LINE_BYTES], nonce)?;
        image.write_line(addr, &ciphertext);

        let (mac_block, slot) = geo.mac_slot(addr);
        let index = (mac_block.get() - geo.mac_block_addr(0).get()) / LINE_BYTES as u64;
        macs[index as usize].set_tag(slot, &crypto.tag(&ciphertext, nonce));
    }
    for (index, block) in macs.iter().enumerate() {
        image.write_line(geo.mac_block_addr(index as u64), block.as_line());
    }

    // Counter blocks are all zero already
    let built = tree::build(&geo, |_| [0; LINE_BYTES]);
    for (node, line) in &built.nodes {
        image.write_line(geo.node_addr(*node), line);
    }

    Ok(Provisioned {
        root: built.root,
        image,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SecCtrlConfig {
        SecCtrlConfig {
            data_bytes: 64 * 64,
            ..SecCtrlConfig::default()
        }
    }

    #[test]
    fn provisioned_image_is_consistent() {
        let config = small();
        let geo = Geometry::new(&config).unwrap();
        let provisioned = provision(&config).unwrap();
        assert_eq!(provisioned.image.size(), geo.memory_range().end);
        assert_eq!(provisioned.image.tree_root(&geo), provisioned.root);

        let crypto = CryptoUnit::new(&config.keys, geo.tag_bytes());
        let addr = BlockAddr::from_line_index(13);
        let ciphertext = provisioned.image.read_line(addr).unwrap();
        let nonce = Nonce::new(addr, 0);
        assert_eq!(crypto.decrypt(&ciphertext, nonce).unwrap(), [0; LINE_BYTES]);

        let (mac_block, slot) = geo.mac_slot(addr);
        let tag = MacBlock::from_line(provisioned.image.read_line(mac_block).unwrap())
            .tag(slot, geo.tag_bytes());
        assert!(crypto.check_tag(&ciphertext, nonce, &tag));
    }

    #[test]
    fn images_survive_disk() {
        let provisioned = provision(&small()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");
        provisioned.save(&path).unwrap();
        let loaded = Provisioned::load(&path).unwrap();
        assert_eq!(loaded.root, provisioned.root);
        assert!(loaded.image == provisioned.image);
    }

    #[test]
    fn line_access_is_bounds_checked() {
        let mut image = MemoryImage::zeroed(128);
        assert!(image.write_line(BlockAddr::from_line_index(1), &[3; 64]));
        assert!(!image.write_line(BlockAddr::from_line_index(2), &[3; 64]));
        assert_eq!(image.read_line(BlockAddr::from_line_index(2)), None);
        assert!(image.flip_bit(64, 1));
        assert_eq!(image.read_line(BlockAddr::from_line_index(1)).unwrap()[0], 1);
        assert!(!image.flip_bit(128, 0));
    }
}
