// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

use std::collections::HashSet;

use crate::config::Tick;
use crate::geometry::BlockAddr;
use crate::geometry::Line;
use crate::geometry::MetaKey;
use crate::port::ReqId;

/// Progress of a CPU-side request
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
pub enum ReqState {
    /// Waiting behind an older request to the same line
    Queued,
    /// Looking up metadata and issuing fetches
    Lookup,
    /// Waiting for fetched metadata to be verified
    Verify,
    /// Decrypting and checking, or re-encrypting and re-tagging
    Crypto,
    /// Write sent to memory, waiting for its acknowledgement
    Commit,
    /// Terminal. A fault has been raised.
    Violation,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write(Line),
}

#[derive(Debug)]
pub struct PendingRequest {
    pub id: ReqId,
    pub addr: BlockAddr,
    pub access: Access,
    pub state: ReqState,
    /// Tick at which everything obtained so far is available
    pub ready: Tick,
    /// Ciphertext read from memory
    pub data: Option<Line>,
    /// Metadata blocks with a fill outstanding on this request's behalf
    pub waiting: HashSet<MetaKey>,
    /// Metadata blocks pinned by this request
    pub pinned: Vec<MetaKey>,
}

impl PendingRequest {
    pub fn new(id: ReqId, addr: BlockAddr, access: Access, now: Tick) -> Self {
        Self {
            id,
            addr,
            access,
            state: ReqState::Queued,
            ready: now,
            data: None,
            waiting: HashSet::new(),
            pinned: Vec::new(),
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self.access, Access::Write(_))
    }

    /// Cancellation is only possible before anything has been committed
    pub fn cancellable(&self) -> bool {
        self.state < ReqState::Crypto
    }

    pub fn ready_at(&mut self, tick: Tick) {
        self.ready = self.ready.max(tick);
    }
}

/// Unit of work processed by the controller's run loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Work {
    /// A request became head of its address queue
    Start(ReqId),
    /// Something a request waits on has arrived
    Advance(ReqId),
    /// Contents of a metadata block are available for verification
    Fill { key: MetaKey, line: Line },
}
