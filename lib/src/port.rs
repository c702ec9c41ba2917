// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Packets exchanged with the CPU side and the memory side.
//!
//! The controller never talks to its collaborators directly. Outbound memory
//! packets are queued per port in an [`Outbox`] together with the tick at which
//! they may leave, and responses are pushed back into the controller.

use std::collections::VecDeque;

use crate::config::PortLayout;
use crate::config::Tick;
use crate::fault::Fault;
use crate::geometry::BlockAddr;
use crate::geometry::Line;
use crate::geometry::MetaKind;

/// Identifier of a CPU-side request, unique for the controller's lifetime
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct ReqId(pub u64);

impl std::fmt::Display for ReqId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Identifier of a memory-side packet
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(pub u64);

/// Memory-side ports of the controller
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PortId {
    /// Ciphertext of data lines
    MemSide,
    /// Counter blocks
    Cnt,
    /// Tree nodes
    Mt,
    /// MAC blocks
    Mac,
    /// All metadata, when ports are merged
    Meta,
}

impl PortId {
    /// Port carrying metadata of the given kind
    pub fn for_meta(kind: MetaKind, layout: PortLayout) -> Self {
        match (layout, kind) {
            (PortLayout::Merged, _) => Self::Meta,
            (PortLayout::Split, MetaKind::Counter) => Self::Cnt,
            (PortLayout::Split, MetaKind::Tree) => Self::Mt,
            (PortLayout::Split, MetaKind::Mac) => Self::Mac,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemCmd {
    Read,
    Write(Line),
}

/// Request leaving the controller towards memory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemPacket {
    pub id: PacketId,
    pub port: PortId,
    pub addr: BlockAddr,
    pub cmd: MemCmd,
    /// Earliest tick at which the packet may be delivered
    pub ready_at: Tick,
}

/// Memory's answer to a [`MemPacket`]. Reads carry the line read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemResponse {
    pub id: PacketId,
    pub addr: BlockAddr,
    pub data: Option<Line>,
}

impl MemResponse {
    /// Answer `packet` with `data` for reads and nothing for writes.
    pub fn to(packet: &MemPacket, data: Option<Line>) -> Self {
        Self {
            id: packet.id,
            addr: packet.addr,
            data,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CpuOp {
    Read,
    Write(Line),
}

/// Access of one line arriving on the CPU-side port
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuRequest {
    pub addr: u64,
    pub op: CpuOp,
}

impl CpuRequest {
    pub fn read(addr: u64) -> Self {
        Self {
            addr,
            op: CpuOp::Read,
        }
    }

    pub fn write(addr: u64, data: Line) -> Self {
        Self {
            addr,
            op: CpuOp::Write(data),
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self.op, CpuOp::Write(_))
    }
}

/// Successful outcome of a CPU-side access
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Verified plaintext
    Read(Line),
    /// The line has been re-secured and written to memory
    Write,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuResponse {
    pub id: ReqId,
    pub addr: BlockAddr,
    /// Tick at which the response is available to the requester
    pub ready_at: Tick,
    pub result: Result<Completion, Fault>,
}

/// Events emitted on the CPU-side port
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CpuEvent {
    Response(CpuResponse),
    /// A previously rejected requester may try again
    Retry,
}

/// Per-port queues of outbound packets
#[derive(Debug, Default)]
pub struct Outbox {
    queues: [VecDeque<MemPacket>; 5],
}

fn slot(port: PortId) -> usize {
    match port {
        PortId::MemSide => 0,
        PortId::Cnt => 1,
        PortId::Mt => 2,
        PortId::Mac => 3,
        PortId::Meta => 4,
    }
}

impl Outbox {
    pub fn push(&mut self, packet: MemPacket) {
        self.queues[slot(packet.port)].push_back(packet);
    }

    /// Oldest packet waiting on `port`
    pub fn take(&mut self, port: PortId) -> Option<MemPacket> {
        self.queues[slot(port)].pop_front()
    }

    /// All waiting packets across ports, ordered by departure tick
    pub fn drain(&mut self) -> Vec<MemPacket> {
        let mut packets: Vec<_> = self.queues.iter_mut().flat_map(|q| q.drain(..)).collect();
        packets.sort_by_key(|p| (p.ready_at, p.id));
        packets
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    pub fn len(&self, port: PortId) -> usize {
        self.queues[slot(port)].len()
    }
}
