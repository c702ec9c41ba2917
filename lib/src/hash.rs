// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Digests used by the integrity tree

use sha2::Digest as _;
use sha2::Sha256;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum DigestError {
    #[error("Invalid digest size {0}, expected {DIGEST_SIZE}")]
    InvalidDigestSize(usize),

    #[error("Invalid hex digest: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Size of digest produced by the underlying hash function
pub const DIGEST_SIZE: usize = 32;

/// A value of type [`Digest`] indicates that the enclosed array was produced by
/// SHA-256, either directly via [`Digest::of_parts`] or by converting from a
/// suitably sized byte slice.
#[derive(Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Digest {
    #[serde(with = "hex")]
    digest: [u8; DIGEST_SIZE],
}

impl Digest {
    /// Hash a sequence of byte chunks as if they were concatenated.
    pub fn of_parts<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_ref());
        }
        Digest {
            digest: hasher.finalize().into(),
        }
    }

    /// First `len` bytes of the digest. Tree slots store truncated digests.
    pub fn truncated(&self, len: usize) -> &[u8] {
        &self.digest[..len.min(DIGEST_SIZE)]
    }

    /// Lower-case hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.digest)
    }

    /// Parse a hex rendering as produced by [`Digest::to_hex`]
    pub fn from_hex(value: &str) -> Result<Self, DigestError> {
        hex::decode(value)?.as_slice().try_into()
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<&[u8]> for Digest {
    type Error = DigestError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let digest: [u8; DIGEST_SIZE] = value
            .try_into()
            .map_err(|_| DigestError::InvalidDigestSize(value.len()))?;
        Ok(Digest { digest })
    }
}

impl From<Digest> for [u8; DIGEST_SIZE] {
    fn from(value: Digest) -> Self {
        value.digest
    }
}

impl From<[u8; DIGEST_SIZE]> for Digest {
    fn from(digest: [u8; DIGEST_SIZE]) -> Self {
        Digest { digest }
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.digest
    }
}
