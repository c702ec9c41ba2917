// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Minimal stand-ins for the controller's collaborators.
//!
//! [`SimpleMemory`] answers every packet after a fixed latency plus optional
//! seeded jitter, and lets tests tamper with its contents. [`Simulation`] is a
//! discrete-event loop that moves packets between the controller and the
//! memory in tick order.

use std::collections::BTreeMap;
use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use thiserror::Error;

use crate::config::SecCtrlConfig;
use crate::config::Tick;
use crate::controller::AtomicMemory;
use crate::controller::SecCtrl;
use crate::fault::CancelError;
use crate::fault::Fault;
use crate::fault::RequestError;
use crate::geometry::BlockAddr;
use crate::geometry::Line;
use crate::hash::Digest;
use crate::image::provision;
use crate::image::ImageError;
use crate::image::MemoryImage;
use crate::log;
use crate::port::Completion;
use crate::port::CpuEvent;
use crate::port::CpuRequest;
use crate::port::CpuResponse;
use crate::port::MemCmd;
use crate::port::MemPacket;
use crate::port::MemResponse;
use crate::port::ReqId;

/// Flat backing memory with a simple latency model
#[derive(Debug)]
pub struct SimpleMemory {
    image: MemoryImage,
    latency: Tick,
    jitter: Tick,
    rng: StdRng,
    reads: u64,
    writes: u64,
}

impl SimpleMemory {
    pub fn new(image: MemoryImage, latency: Tick) -> Self {
        Self {
            image,
            latency,
            jitter: 0,
            rng: StdRng::seed_from_u64(0),
            reads: 0,
            writes: 0,
        }
    }

    /// Add up to `jitter` ticks of extra latency per access, drawn from a
    /// generator seeded with `seed`.
    pub fn with_jitter(mut self, jitter: Tick, seed: u64) -> Self {
        self.jitter = jitter;
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Perform a packet. The access takes effect immediately; the returned
    /// latency says when the response is due.
    pub fn access(&mut self, packet: &MemPacket) -> (MemResponse, Tick) {
        let latency = self.latency
            + if self.jitter > 0 {
                self.rng.gen_range(0..=self.jitter)
            } else {
                0
            };

        let data = match &packet.cmd {
            MemCmd::Read => {
                self.reads += 1;
                self.image.read_line(packet.addr)
            }
            MemCmd::Write(line) => {
                self.writes += 1;
                if !self.image.write_line(packet.addr, line) {
                    log::warning!("Write to {} outside of memory dropped", packet.addr);
                }
                None
            }
        };
        (MemResponse::to(packet, data), latency)
    }

    pub fn image(&self) -> &MemoryImage {
        &self.image
    }

    pub fn peek(&self, addr: BlockAddr) -> Option<Line> {
        self.image.read_line(addr)
    }

    pub fn poke(&mut self, addr: BlockAddr, line: &Line) -> bool {
        self.image.write_line(addr, line)
    }

    pub fn flip_bit(&mut self, addr: u64, bit: u8) -> bool {
        self.image.flip_bit(addr, bit)
    }

    /// Reads and writes served so far
    pub fn accesses(&self) -> (u64, u64) {
        (self.reads, self.writes)
    }
}

impl AtomicMemory for SimpleMemory {
    fn access_atomic(&mut self, packet: &MemPacket) -> (MemResponse, Tick) {
        self.access(packet)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error(transparent)]
    Rejected(#[from] RequestError),

    #[error(transparent)]
    Fault(#[from] Fault),

    #[error("{0} finished without a response")]
    Lost(ReqId),
}

/// Discrete-event driver for one controller and its memory
pub struct Simulation {
    ctrl: SecCtrl,
    mem: SimpleMemory,
    now: Tick,
    /// Memory responses by delivery tick, ties broken by issue order
    in_flight: BTreeMap<(Tick, u64), MemResponse>,
    seq: u64,
    completions: HashMap<ReqId, CpuResponse>,
    retries: u64,
}

impl Simulation {
    pub fn new(ctrl: SecCtrl, mem: SimpleMemory) -> Self {
        Self {
            ctrl,
            mem,
            now: 0,
            in_flight: BTreeMap::new(),
            seq: 0,
            completions: HashMap::new(),
            retries: 0,
        }
    }

    /// Provision a fresh image for `config` and put a controller in front of it.
    pub fn provisioned(config: SecCtrlConfig, latency: Tick) -> Result<Self, ImageError> {
        let provisioned = provision(&config)?;
        let ctrl = SecCtrl::new(config, provisioned.root)?;
        Ok(Self::new(ctrl, SimpleMemory::new(provisioned.image, latency)))
    }

    pub fn now(&self) -> Tick {
        self.now
    }

    pub fn controller(&self) -> &SecCtrl {
        &self.ctrl
    }

    pub fn controller_mut(&mut self) -> &mut SecCtrl {
        &mut self.ctrl
    }

    pub fn memory(&self) -> &SimpleMemory {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut SimpleMemory {
        &mut self.mem
    }

    /// Retry events received so far
    pub fn retries(&self) -> u64 {
        self.retries
    }

    /// Hand a request to the controller at the current tick.
    pub fn issue(&mut self, request: CpuRequest) -> Result<ReqId, RequestError> {
        let id = self.ctrl.recv_timing_req(self.now, request)?;
        self.collect_events();
        Ok(id)
    }

    /// Withdraw a request at the current tick.
    pub fn cancel(&mut self, id: ReqId) -> Result<(), CancelError> {
        self.ctrl.cancel(id, self.now)?;
        self.collect_events();
        Ok(())
    }

    /// Evict the metadata of `addr`'s set and wait for any write-back.
    pub fn evict_metadata(&mut self, addr: BlockAddr) -> usize {
        let sent = self.ctrl.evict_metadata(addr, self.now);
        self.run_until_idle();
        sent
    }

    fn collect_events(&mut self) {
        while let Some(event) = self.ctrl.take_cpu_event() {
            match event {
                CpuEvent::Response(response) => {
                    self.completions.insert(response.id, response);
                }
                CpuEvent::Retry => self.retries += 1,
            }
        }
    }

    fn dispatch(&mut self) {
        for packet in self.ctrl.drain_mem_requests() {
            let departure = packet.ready_at.max(self.now);
            let (response, latency) = self.mem.access(&packet);
            self.in_flight.insert((departure + latency, self.seq), response);
            self.seq += 1;
        }
    }

    /// Deliver the next memory response. Returns `false` once nothing is in
    /// flight.
    pub fn step(&mut self) -> bool {
        self.dispatch();
        let Some(((at, _), response)) = self.in_flight.pop_first() else {
            return false;
        };
        self.now = self.now.max(at);
        self.ctrl.recv_timing_resp(self.now, response);
        self.collect_events();
        self.dispatch();
        true
    }

    pub fn run_until_idle(&mut self) {
        while self.step() {}
    }

    /// Response to `id`, if it has completed
    pub fn take_completion(&mut self, id: ReqId) -> Option<CpuResponse> {
        let response = self.completions.remove(&id)?;
        self.now = self.now.max(response.ready_at);
        Some(response)
    }

    fn complete(&mut self, request: CpuRequest) -> Result<(ReqId, Completion), SimError> {
        let id = self.issue(request)?;
        self.run_until_idle();
        let response = self.take_completion(id).ok_or(SimError::Lost(id))?;
        Ok((id, response.result?))
    }

    /// Read a line and wait for the result.
    pub fn read(&mut self, addr: u64) -> Result<Line, SimError> {
        match self.complete(CpuRequest::read(addr))? {
            (_, Completion::Read(line)) => Ok(line),
            (id, Completion::Write) => Err(SimError::Lost(id)),
        }
    }

    /// Write a line and wait for the acknowledgement.
    pub fn write(&mut self, addr: u64, data: Line) -> Result<(), SimError> {
        self.complete(CpuRequest::write(addr, data)).map(|_| ())
    }

    /// Flush all dirty metadata and wait for the write-backs to land.
    pub fn writeback_all(&mut self) {
        self.ctrl.writeback_all(self.now);
        self.run_until_idle();
    }

    /// Flush and drop all unpinned metadata.
    pub fn invalidate_all(&mut self) {
        self.ctrl.invalidate_all(self.now);
        self.run_until_idle();
    }

    /// Root recomputed from the counter blocks currently in memory
    pub fn memory_root(&self) -> Digest {
        self.mem.image().tree_root(self.ctrl.geometry())
    }
}
