// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Line encryption and authentication.
//!
//! Lines are encrypted in counter mode: the ChaCha20 keystream for the nonce
//! `(line index, counter)` is XORed onto the line. Tags are SHA-256 over the
//! authentication key followed by a fixed-length, domain-separated message
//! binding the ciphertext to its address and counter.

use chacha20::cipher::NewCipher;
use chacha20::cipher::StreamCipher;
use chacha20::ChaCha20;
use sha2::Digest as _;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::KeyMaterial;
use crate::geometry::BlockAddr;
use crate::geometry::Line;

/// Domain separator for tag computation
const TAG_DOMAIN: &[u8; 8] = b"sc-mac\0\0";

/// Widest supported tag
pub const MAX_TAG_BYTES: usize = 16;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ChaCha20 keystream exhausted")]
    KeystreamExhausted,
}

/// Per-line nonce. Unique as long as a counter is never reused for a line.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Nonce {
    line: u32,
    counter: u64,
}

impl Nonce {
    /// Build the nonce of a data line.
    ///
    /// Line indices fit 32 bits for every validated configuration.
    pub fn new(addr: BlockAddr, counter: u64) -> Self {
        Self {
            line: addr.line_index() as u32,
            counter,
        }
    }

    fn to_bytes(self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[..8].copy_from_slice(&self.counter.to_le_bytes());
        bytes[8..].copy_from_slice(&self.line.to_le_bytes());
        bytes
    }
}

/// Authentication tag of a line, `len` bytes wide
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Tag {
    bytes: [u8; MAX_TAG_BYTES],
    len: u8,
}

impl Tag {
    pub fn from_slice(bytes: &[u8]) -> Self {
        let len = bytes.len().min(MAX_TAG_BYTES);
        let mut tag = Self {
            bytes: [0; MAX_TAG_BYTES],
            len: len as u8,
        };
        tag.bytes[..len].copy_from_slice(&bytes[..len]);
        tag
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl std::fmt::Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tag({})", hex::encode(self.as_bytes()))
    }
}

/// Stateless encryption and authentication engine
pub struct CryptoUnit {
    encryption: chacha20::Key,
    authentication: [u8; 32],
    tag_bytes: usize,
}

impl CryptoUnit {
    pub fn new(keys: &KeyMaterial, tag_bytes: usize) -> Self {
        Self {
            encryption: *chacha20::Key::from_slice(&keys.encryption),
            authentication: keys.authentication,
            tag_bytes: tag_bytes.min(MAX_TAG_BYTES),
        }
    }

    fn keystream(&self, line: &Line, nonce: Nonce) -> Result<Line, CryptoError> {
        let nonce = nonce.to_bytes();
        let mut cipher = ChaCha20::new(&self.encryption, chacha20::Nonce::from_slice(&nonce));
        let mut output = *line;
        cipher
            .try_apply_keystream(&mut output)
            .map_err(|_| CryptoError::KeystreamExhausted)?;
        Ok(output)
    }

    /// Encrypt a plaintext line.
    pub fn encrypt(&self, plaintext: &Line, nonce: Nonce) -> Result<Line, CryptoError> {
        self.keystream(plaintext, nonce)
    }

    /// Decrypt a ciphertext line.
    pub fn decrypt(&self, ciphertext: &Line, nonce: Nonce) -> Result<Line, CryptoError> {
        self.keystream(ciphertext, nonce)
    }

    /// Compute the tag binding `ciphertext` to its nonce.
    pub fn tag(&self, ciphertext: &Line, nonce: Nonce) -> Tag {
        let mut hasher = Sha256::new();
        hasher.update(self.authentication);
        hasher.update(TAG_DOMAIN);
        hasher.update(nonce.to_bytes());
        hasher.update(ciphertext);
        let digest: [u8; 32] = hasher.finalize().into();
        Tag::from_slice(&digest[..self.tag_bytes])
    }

    /// Recompute the tag and compare it in constant time.
    pub fn check_tag(&self, ciphertext: &Line, nonce: Nonce, tag: &Tag) -> bool {
        let expected = self.tag(ciphertext, nonce);
        expected.as_bytes().ct_eq(tag.as_bytes()).into()
    }
}
