// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Faults that terminate a CPU-side request

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::geometry::BlockAddr;
use crate::geometry::MetaKey;
use crate::tree::TreeError;

/// Processing stage in which a violation was detected
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum Stage {
    #[strum(serialize = "fetch")]
    Fetch,
    #[strum(serialize = "tree verification")]
    TreeVerification,
    #[strum(serialize = "crypto")]
    Crypto,
}

/// What did not match
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum Cause {
    /// Recomputed MAC differs from the stored tag
    #[strum(serialize = "tag mismatch")]
    TagMismatch,
    /// Digest of a block differs from its parent's slot
    #[strum(serialize = "digest mismatch")]
    DigestMismatch,
    /// Digest of the top node differs from the on-chip root
    #[strum(serialize = "root mismatch")]
    RootMismatch,
    /// Memory answered a metadata read without data
    #[strum(serialize = "missing data")]
    MissingData,
}

/// Detected tampering or corruption of off-chip state
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("Integrity violation for {addr} during {stage}: {cause} in {failed}")]
pub struct IntegrityViolation {
    /// Data line the request was accessing
    pub addr: BlockAddr,
    pub stage: Stage,
    /// Metadata block whose check failed
    pub failed: MetaKey,
    pub cause: Cause,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Fault {
    #[error(transparent)]
    Integrity(#[from] IntegrityViolation),

    #[error("Counter of {0} is exhausted")]
    CounterExhausted(BlockAddr),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("{0} left the cache while the request held it")]
    NotResident(MetaKey),
}

impl Fault {
    pub fn as_violation(&self) -> Option<&IntegrityViolation> {
        match self {
            Self::Integrity(violation) => Some(violation),
            _ => None,
        }
    }
}

/// Synchronous rejection of a CPU-side request
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("Address {0:#x} is not line-aligned")]
    Misaligned(u64),

    #[error("Address {0:#x} is outside the protected region")]
    OutOfRange(u64),

    #[error("Too many requests in flight, wait for a retry")]
    Busy,

    #[error("Atomic access did not complete")]
    Incomplete,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("Unknown request")]
    Unknown,

    #[error("Request already passed the point of no return")]
    TooLate,
}
