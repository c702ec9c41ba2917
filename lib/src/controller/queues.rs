// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Per-address serialisation of requests

use std::collections::HashMap;
use std::collections::VecDeque;

use crate::geometry::BlockAddr;
use crate::port::ReqId;

/// FIFO of request ids per line. Only the head of a queue is active.
#[derive(Debug, Default)]
pub struct AddressQueues {
    queues: HashMap<BlockAddr, VecDeque<ReqId>>,
}

impl AddressQueues {
    /// Enqueue `id`. Returns `true` if it is the head and may start right away.
    pub fn push(&mut self, addr: BlockAddr, id: ReqId) -> bool {
        let queue = self.queues.entry(addr).or_default();
        queue.push_back(id);
        queue.len() == 1
    }

    /// Remove `id` from its queue. Returns the request that becomes head as a
    /// consequence, if any.
    pub fn remove(&mut self, addr: BlockAddr, id: ReqId) -> Option<ReqId> {
        let queue = self.queues.get_mut(&addr)?;
        let position = queue.iter().position(|queued| *queued == id)?;
        queue.remove(position);

        let next = if position == 0 {
            queue.front().copied()
        } else {
            None
        };
        if queue.is_empty() {
            self.queues.remove(&addr);
        }
        next
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
