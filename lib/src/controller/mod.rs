// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! The security controller.
//!
//! Requests from the CPU side are kept in a table and driven through
//! `Lookup → Verify → Crypto → Commit` by an internal work queue. The
//! controller is re-entered whenever a request arrives or memory answers one
//! of its packets, and runs its queue to completion before returning. Requests
//! to the same line are serialised; requests to different lines interleave
//! freely.
//!
//! Fetched counter blocks and tree nodes are only cached once they have been
//! verified against their parent. A block whose parent is not cached is parked
//! until the parent has been fetched and verified in turn, so a verification
//! walks up the tree only as far as the first cached ancestor.

pub mod queues;
pub mod request;
pub mod stats;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::ops::Range;

use crate::config::CacheConfig;
use crate::config::ConfigError;
use crate::config::SecCtrlConfig;
use crate::config::Tick;
use crate::config::WritebackPolicy;
use crate::crypto::CryptoUnit;
use crate::crypto::Nonce;
use crate::crypto::Tag;
use crate::fault::Cause;
use crate::fault::CancelError;
use crate::fault::Fault;
use crate::fault::IntegrityViolation;
use crate::fault::RequestError;
use crate::fault::Stage;
use crate::geometry::BlockAddr;
use crate::geometry::Geometry;
use crate::geometry::Line;
use crate::geometry::MetaKey;
use crate::geometry::MetaKind;
use crate::geometry::NodeId;
use crate::geometry::LINE_BYTES;
use crate::hash::Digest;
use crate::log;
use crate::metadata::counters::CounterStore;
use crate::metadata::macs::MacStore;
use crate::metadata::FillAction;
use crate::metadata::Waiter;
use crate::port::Completion;
use crate::port::CpuEvent;
use crate::port::CpuOp;
use crate::port::CpuRequest;
use crate::port::CpuResponse;
use crate::port::MemCmd;
use crate::port::MemPacket;
use crate::port::MemResponse;
use crate::port::Outbox;
use crate::port::PacketId;
use crate::port::PortId;
use crate::port::ReqId;
use crate::tree::IntegrityTree;
use crate::tree::PathCheck;
use queues::AddressQueues;
use request::Access;
use request::PendingRequest;
use request::ReqState;
use request::Work;
use stats::Stats;

/// Memory that answers packets synchronously, for atomic-mode accesses
pub trait AtomicMemory {
    /// Perform `packet` right away. Returns the response and the access latency.
    fn access_atomic(&mut self, packet: &MemPacket) -> (MemResponse, Tick);
}

/// What a memory-side packet was sent for
#[derive(Copy, Clone, Debug)]
enum Outstanding {
    DataRead(ReqId),
    DataWrite(ReqId),
    Fill(MetaKey),
    Writeback(MetaKey),
}

pub struct SecCtrl {
    config: SecCtrlConfig,
    geo: Geometry,
    crypto: CryptoUnit,
    counters: CounterStore,
    macs: MacStore,
    tree: IntegrityTree,
    requests: HashMap<ReqId, PendingRequest>,
    queues: AddressQueues,
    /// Fetched blocks waiting for their parent to be verified
    parked: HashMap<NodeId, Vec<(MetaKey, Line)>>,
    outstanding: HashMap<PacketId, Outstanding>,
    outbox: Outbox,
    events: VecDeque<CpuEvent>,
    work: VecDeque<Work>,
    next_request: u64,
    next_packet: u64,
    /// A request was turned away and its sender awaits a retry
    retry_owed: bool,
    stats: Stats,
}

impl SecCtrl {
    /// Instantiate a controller over memory whose tree is anchored by `root`.
    pub fn new(config: SecCtrlConfig, root: Digest) -> Result<Self, ConfigError> {
        let geo = Geometry::new(&config)?;
        Ok(Self {
            crypto: CryptoUnit::new(&config.keys, geo.tag_bytes()),
            counters: CounterStore::new(&geo, &config.counter_cache)?,
            macs: MacStore::new(&geo, &config.mac_cache)?,
            tree: IntegrityTree::new(&geo, &config.tree_cache, root)?,
            requests: HashMap::new(),
            queues: AddressQueues::default(),
            parked: HashMap::new(),
            outstanding: HashMap::new(),
            outbox: Outbox::default(),
            events: VecDeque::new(),
            work: VecDeque::new(),
            next_request: 0,
            next_packet: 0,
            retry_owed: false,
            stats: Stats::default(),
            config,
            geo,
        })
    }

    pub fn config(&self) -> &SecCtrlConfig {
        &self.config
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// Address ranges served on the CPU side
    pub fn addr_ranges(&self) -> Vec<Range<u64>> {
        vec![self.geo.data_range()]
    }

    /// The trusted on-chip root
    pub fn root(&self) -> Digest {
        self.tree.root()
    }

    /// Cached counter of a data line, if its counter block is resident
    pub fn peek_counter(&self, addr: BlockAddr) -> Option<u64> {
        self.counters.get(addr)
    }

    pub fn stats(&self) -> Stats {
        Stats {
            counter: self.counters.store().stats(),
            mac: self.macs.store().stats(),
            tree: self.tree.store().stats(),
            ..self.stats
        }
    }

    /// Number of requests in the pending table
    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    /// State of a pending request
    pub fn request_state(&self, id: ReqId) -> Option<ReqState> {
        self.requests.get(&id).map(|req| req.state)
    }

    /// Nothing in flight on either side
    pub fn is_idle(&self) -> bool {
        self.requests.is_empty()
            && self.outstanding.is_empty()
            && self.work.is_empty()
            && self.parked.is_empty()
            && self.outbox.is_empty()
            && self.counters.store().is_idle()
            && self.macs.store().is_idle()
            && self.tree.store().is_idle()
    }

    /// Next packet waiting to leave on `port`
    pub fn take_mem_request(&mut self, port: PortId) -> Option<MemPacket> {
        self.outbox.take(port)
    }

    /// Every packet waiting to leave, in departure order
    pub fn drain_mem_requests(&mut self) -> Vec<MemPacket> {
        self.outbox.drain()
    }

    pub fn take_cpu_event(&mut self) -> Option<CpuEvent> {
        self.events.pop_front()
    }

    /// Accept a request on the CPU-side port.
    pub fn recv_timing_req(&mut self, now: Tick, request: CpuRequest) -> Result<ReqId, RequestError> {
        let addr = BlockAddr::new(request.addr).ok_or(RequestError::Misaligned(request.addr))?;
        if !self.geo.data_range().contains(&request.addr) {
            return Err(RequestError::OutOfRange(request.addr));
        }
        if self.requests.len() >= self.config.max_pending {
            self.retry_owed = true;
            self.stats.rejected += 1;
            return Err(RequestError::Busy);
        }

        let id = ReqId(self.next_request);
        self.next_request += 1;
        let access = match request.op {
            CpuOp::Read => {
                self.stats.reads += 1;
                Access::Read
            }
            CpuOp::Write(data) => {
                self.stats.writes += 1;
                Access::Write(data)
            }
        };
        log::trace!("{id}: {access:?} {addr} at {now}");

        self.requests
            .insert(id, PendingRequest::new(id, addr, access, now));
        if self.queues.push(addr, id) {
            self.work.push_back(Work::Start(id));
        }
        self.run(now);
        Ok(id)
    }

    /// Accept memory's response to one of our packets.
    pub fn recv_timing_resp(&mut self, now: Tick, response: MemResponse) {
        let Some(outstanding) = self.outstanding.remove(&response.id) else {
            log::warning!("Dropping response to unknown packet {:?}", response.id);
            return;
        };

        match outstanding {
            Outstanding::DataRead(id) => {
                if let Some(req) = self.requests.get_mut(&id) {
                    req.data = Some(data_line(&response));
                    req.ready_at(now);
                    self.work.push_back(Work::Advance(id));
                }
            }
            Outstanding::DataWrite(id) => self.finish(id, Ok(Completion::Write), now),
            Outstanding::Fill(key) => match response.data {
                Some(line) => self.work.push_back(Work::Fill { key, line }),
                None => {
                    log::warning!("Fill of {key} at {} carries no data", response.addr);
                    self.reject(key, Cause::MissingData, Stage::Fetch, now);
                }
            },
            Outstanding::Writeback(key) => match key {
                MetaKey::Counter(addr) => self.counters.store_mut().writeback_done(&addr),
                MetaKey::Mac(addr) => self.macs.store_mut().writeback_done(&addr),
                MetaKey::Node(node) => self.tree.store_mut().writeback_done(&node),
            },
        }
        self.run(now);
    }

    /// Withdraw a request that has not reached the crypto stage.
    pub fn cancel(&mut self, id: ReqId, now: Tick) -> Result<(), CancelError> {
        let req = self.requests.get(&id).ok_or(CancelError::Unknown)?;
        if !req.cancellable() {
            return Err(CancelError::TooLate);
        }
        if let Some(req) = self.requests.remove(&id) {
            log::debug!("{id}: cancelled in state {}", req.state);
            self.stats.cancelled += 1;
            self.retire(req, now);
            self.grant_retry();
        }
        self.run(now);
        Ok(())
    }

    /// Write every dirty metadata block back to memory. Blocks stay cached.
    pub fn writeback_all(&mut self, now: Tick) {
        let mut writebacks = Vec::new();
        writebacks.extend(
            self.counters
                .store_mut()
                .flush()
                .into_iter()
                .map(|(addr, line)| (MetaKey::Counter(addr), line)),
        );
        writebacks.extend(
            self.macs
                .store_mut()
                .flush()
                .into_iter()
                .map(|(addr, line)| (MetaKey::Mac(addr), line)),
        );
        writebacks.extend(
            self.tree
                .store_mut()
                .flush()
                .into_iter()
                .map(|(node, line)| (MetaKey::Node(node), line)),
        );
        log::debug!("Flushing {} metadata blocks", writebacks.len());
        self.send_writebacks(writebacks, now);
    }

    /// Evict the least recently used unpinned counter and MAC blocks sharing a
    /// set with `addr`'s metadata. Dirty victims are written back. Returns the
    /// number of write-backs sent.
    pub fn evict_metadata(&mut self, addr: BlockAddr, now: Tick) -> usize {
        let mut writebacks = Vec::new();
        writebacks.extend(
            self.counters
                .evict_one(addr)
                .map(|(block, line)| (MetaKey::Counter(block), line)),
        );
        writebacks.extend(
            self.macs
                .evict_one(addr)
                .map(|(block, line)| (MetaKey::Mac(block), line)),
        );
        let sent = writebacks.len();
        self.send_writebacks(writebacks, now);
        self.run(now);
        sent
    }

    /// Flush, then drop every metadata block not pinned by a pending request.
    pub fn invalidate_all(&mut self, now: Tick) {
        self.writeback_all(now);
        let mut writebacks = Vec::new();
        writebacks.extend(
            self.counters
                .store_mut()
                .invalidate()
                .into_iter()
                .map(|(addr, line)| (MetaKey::Counter(addr), line)),
        );
        writebacks.extend(
            self.macs
                .store_mut()
                .invalidate()
                .into_iter()
                .map(|(addr, line)| (MetaKey::Mac(addr), line)),
        );
        writebacks.extend(
            self.tree
                .store_mut()
                .invalidate()
                .into_iter()
                .map(|(node, line)| (MetaKey::Node(node), line)),
        );
        self.send_writebacks(writebacks, now);
    }

    /// Run a request to completion against memory that answers synchronously.
    ///
    /// Atomic and timing accesses are not mixed, so the controller must be
    /// idle.
    pub fn access_atomic(
        &mut self,
        now: Tick,
        request: CpuRequest,
        mem: &mut impl AtomicMemory,
    ) -> Result<CpuResponse, RequestError> {
        if !self.is_idle() {
            return Err(RequestError::Busy);
        }
        let id = self.recv_timing_req(now, request)?;

        loop {
            let position = self
                .events
                .iter()
                .position(|event| matches!(event, CpuEvent::Response(resp) if resp.id == id));
            if let Some(CpuEvent::Response(response)) = position.and_then(|i| self.events.remove(i)) {
                return Ok(response);
            }

            let packets = self.outbox.drain();
            if packets.is_empty() {
                log::error!("{id}: atomic access stopped making progress");
                return Err(RequestError::Incomplete);
            }
            for packet in packets {
                let (response, latency) = mem.access_atomic(&packet);
                self.recv_timing_resp(packet.ready_at + latency, response);
            }
        }
    }

    fn run(&mut self, now: Tick) {
        while let Some(work) = self.work.pop_front() {
            match work {
                Work::Start(id) => self.start(id, now),
                Work::Advance(id) => self.advance(id, now),
                Work::Fill { key, line } => {
                    let at = now + self.cache_config(key.kind()).response_latency;
                    self.settle(key, line, at);
                }
            }
        }
    }

    fn cache_config(&self, kind: MetaKind) -> &CacheConfig {
        match kind {
            MetaKind::Counter => &self.config.counter_cache,
            MetaKind::Mac => &self.config.mac_cache,
            MetaKind::Tree => &self.config.tree_cache,
        }
    }

    /// Metadata blocks a request needs before it can enter the crypto stage
    fn needs(&self, req: &PendingRequest) -> Vec<MetaKey> {
        let (counter_block, _) = self.geo.counter_slot(req.addr);
        let (mac_block, _) = self.geo.mac_slot(req.addr);
        let mut keys = vec![MetaKey::Counter(counter_block), MetaKey::Mac(mac_block)];
        if req.is_write() {
            keys.extend(self.geo.path(counter_block).into_iter().map(MetaKey::Node));
        }
        keys
    }

    fn start(&mut self, id: ReqId, now: Tick) {
        let Some(mut req) = self.requests.remove(&id) else {
            return;
        };
        req.state = ReqState::Lookup;

        let mut latency = 0;
        for key in self.needs(&req) {
            if self.probe(key) {
                latency = latency.max(self.cache_config(key.kind()).hit_latency());
            }
        }
        req.ready_at(now + latency);

        if !req.is_write() {
            self.send(
                PortId::MemSide,
                req.addr,
                MemCmd::Read,
                now,
                Outstanding::DataRead(id),
            );
        }

        self.requests.insert(id, req);
        self.advance(id, now);
    }

    /// Pin what is cached, fetch what is not, and move on to the crypto stage
    /// once everything is in place.
    fn advance(&mut self, id: ReqId, now: Tick) {
        let Some(mut req) = self.requests.remove(&id) else {
            return;
        };
        if !matches!(req.state, ReqState::Lookup | ReqState::Verify) {
            self.requests.insert(id, req);
            return;
        }

        let mut complete = true;
        for key in self.needs(&req) {
            if req.pinned.contains(&key) {
                continue;
            }
            if self.pin(key) {
                req.pinned.push(key);
                req.waiting.remove(&key);
                continue;
            }

            complete = false;
            if req.waiting.contains(&key) {
                continue;
            }
            match self.request_fill(key, Waiter::Request(id)) {
                FillAction::Send => {
                    self.send_fill(key, now);
                    req.waiting.insert(key);
                }
                FillAction::FromBuffer(line) => {
                    self.work.push_back(Work::Fill { key, line });
                    req.waiting.insert(key);
                }
                FillAction::Wait => {
                    req.waiting.insert(key);
                }
                FillAction::Stalled => {
                    log::trace!("{id}: stalled on MSHRs for {key}");
                }
            }
        }
        if !req.is_write() && req.data.is_none() {
            complete = false;
        }

        if complete {
            req.state = ReqState::Crypto;
            self.requests.insert(id, req);
            self.crypto_step(id, now);
        } else {
            req.state = if req.waiting.is_empty() {
                ReqState::Lookup
            } else {
                ReqState::Verify
            };
            self.requests.insert(id, req);
        }
    }

    fn crypto_step(&mut self, id: ReqId, now: Tick) {
        let Some(mut req) = self.requests.remove(&id) else {
            return;
        };
        let addr = req.addr;
        let (counter_block, _) = self.geo.counter_slot(addr);
        let (mac_block, _) = self.geo.mac_slot(addr);
        let done = req.ready.max(now) + self.config.crypto_latency;

        match req.access.clone() {
            Access::Read => {
                let (Some(counter), Some(tag), Some(ciphertext)) =
                    (self.counters.get(addr), self.macs.get(addr), req.data)
                else {
                    self.relookup(req, now);
                    return;
                };
                self.requests.insert(id, req);

                let nonce = Nonce::new(addr, counter);
                if !self.crypto.check_tag(&ciphertext, nonce, &tag) {
                    let violation = IntegrityViolation {
                        addr,
                        stage: Stage::Crypto,
                        failed: MetaKey::Mac(mac_block),
                        cause: Cause::TagMismatch,
                    };
                    self.fail(id, violation.into(), done);
                    return;
                }
                match self.crypto.decrypt(&ciphertext, nonce) {
                    Ok(plaintext) => self.finish(id, Ok(Completion::Read(plaintext)), done),
                    Err(err) => self.fail(id, err.into(), done),
                }
            }

            Access::Write(plaintext) => {
                let resident = self.macs.get(addr).is_some()
                    && self.tree.path_resident(counter_block);
                let Some(counter) = self.counters.get(addr).filter(|_| resident) else {
                    self.relookup(req, now);
                    return;
                };
                self.requests.insert(id, req);

                if counter >= self.config.counter_max() {
                    self.fail(id, Fault::CounterExhausted(addr), done);
                    return;
                }

                // The counter moves before anything is derived from it
                let counter = counter + 1;
                let nonce = Nonce::new(addr, counter);
                let ciphertext = match self.crypto.encrypt(&plaintext, nonce) {
                    Ok(ciphertext) => ciphertext,
                    Err(err) => {
                        self.fail(id, err.into(), done);
                        return;
                    }
                };
                let tag = self.crypto.tag(&ciphertext, nonce);
                let Some(leaf) = self.commit_metadata(addr, counter, &tag) else {
                    let missing = if self.counters.get(addr).is_none() {
                        MetaKey::Counter(counter_block)
                    } else {
                        MetaKey::Mac(mac_block)
                    };
                    log::error!("{id}: {missing} vanished while pinned");
                    self.fail(id, Fault::NotResident(missing), done);
                    return;
                };
                if let Err(err) = self.tree.update_path(counter_block, &leaf) {
                    log::error!("{id}: {err} after residency check");
                    self.fail(id, err.into(), done);
                    return;
                }
                log::trace!("{id}: {addr} now at counter {counter}, root {}", self.tree.root());

                if self.config.writeback == WritebackPolicy::Eager {
                    self.flush_for(counter_block, mac_block, done);
                }

                self.send(
                    PortId::MemSide,
                    addr,
                    MemCmd::Write(ciphertext),
                    done,
                    Outstanding::DataWrite(id),
                );
                if let Some(req) = self.requests.get_mut(&id) {
                    req.state = ReqState::Commit;
                    req.ready = done;
                }
            }
        }
    }

    /// Store a written line's new counter and tag. Returns the updated counter
    /// block, or `None` with nothing changed if either block is not resident.
    fn commit_metadata(&mut self, addr: BlockAddr, counter: u64, tag: &Tag) -> Option<Line> {
        let previous = self.counters.get(addr)?;
        self.macs.get(addr)?;
        if !self.counters.put(addr, counter) {
            return None;
        }
        if !self.macs.put(addr, tag) {
            self.counters.put(addr, previous);
            return None;
        }
        self.counters.block_line(addr)
    }

    /// Send a request back to lookup after its pinned metadata went missing.
    fn relookup(&mut self, mut req: PendingRequest, now: Tick) {
        log::error!("{}: pinned metadata is not resident", req.id);
        let id = req.id;
        for key in std::mem::take(&mut req.pinned) {
            self.unpin(key, now);
        }
        req.state = ReqState::Lookup;
        self.requests.insert(id, req);
        self.work.push_back(Work::Advance(id));
    }

    /// Write back the metadata touched by a committed write.
    fn flush_for(&mut self, counter_block: BlockAddr, mac_block: BlockAddr, now: Tick) {
        let mut writebacks = Vec::new();
        if let Some((addr, line)) = self.counters.store_mut().flush_key(&counter_block) {
            writebacks.push((MetaKey::Counter(addr), line));
        }
        if let Some((addr, line)) = self.macs.store_mut().flush_key(&mac_block) {
            writebacks.push((MetaKey::Mac(addr), line));
        }
        for node in self.geo.path(counter_block) {
            if let Some((node, line)) = self.tree.store_mut().flush_key(&node) {
                writebacks.push((MetaKey::Node(node), line));
            }
        }
        self.send_writebacks(writebacks, now);
    }

    /// Verify fetched metadata and install it, or park it until its parent
    /// has been verified.
    fn settle(&mut self, key: MetaKey, line: Line, now: Tick) {
        let verdict = self.tree.check(key, &line);
        let mut stack = vec![(key, line, verdict)];

        while let Some((key, line, verdict)) = stack.pop() {
            match verdict {
                PathCheck::Verified => {
                    self.install(key, line, now);
                    // Children are checked against the node while it is
                    // certainly resident
                    if let MetaKey::Node(node) = key {
                        for (child, child_line) in self.parked.remove(&node).unwrap_or_default() {
                            let verdict = self.tree.check(child, &child_line);
                            stack.push((child, child_line, verdict));
                        }
                    }
                }
                PathCheck::Pending(parent) => {
                    log::trace!("{key} waits for {parent}");
                    self.parked.entry(parent).or_default().push((key, line));
                    let parent = MetaKey::Node(parent);
                    match self.request_fill(parent, Waiter::Verification) {
                        FillAction::Send => self.send_fill(parent, now),
                        FillAction::FromBuffer(line) => {
                            self.work.push_back(Work::Fill { key: parent, line })
                        }
                        FillAction::Wait | FillAction::Stalled => {}
                    }
                }
                PathCheck::Violation(cause) => {
                    self.reject(key, cause, Stage::TreeVerification, now)
                }
            }
        }
    }

    fn install(&mut self, key: MetaKey, line: Line, now: Tick) {
        let writebacks: Vec<(MetaKey, Line)> = match key {
            MetaKey::Counter(addr) => self
                .counters
                .store_mut()
                .install(addr, line)
                .into_iter()
                .map(|(addr, line)| (MetaKey::Counter(addr), line))
                .collect(),
            MetaKey::Mac(addr) => self
                .macs
                .store_mut()
                .install(addr, line)
                .into_iter()
                .map(|(addr, line)| (MetaKey::Mac(addr), line))
                .collect(),
            MetaKey::Node(node) => self
                .tree
                .store_mut()
                .install(node, line)
                .into_iter()
                .map(|(node, line)| (MetaKey::Node(node), line))
                .collect(),
        };
        self.send_writebacks(writebacks, now);

        let (waiters, stalled) = self.complete_fill(key);
        for waiter in waiters {
            let Waiter::Request(id) = waiter else {
                continue;
            };
            let wanted = self
                .requests
                .get_mut(&id)
                .is_some_and(|req| req.waiting.remove(&key));
            // Pin right away so the block cannot be evicted before the
            // request gets to run
            if wanted && self.pin(key) {
                if let Some(req) = self.requests.get_mut(&id) {
                    req.pinned.push(key);
                    req.ready_at(now);
                }
            }
            self.work.push_back(Work::Advance(id));
        }
        self.work
            .extend(stalled.into_iter().map(Work::Advance));
    }

    /// Fail everyone waiting on `key`, and everything parked below it.
    fn reject(&mut self, key: MetaKey, cause: Cause, stage: Stage, now: Tick) {
        log::warning!("Integrity violation during {stage}: {cause} in {key}");
        let mut doomed = vec![key];

        while let Some(block) = doomed.pop() {
            let (waiters, stalled) = self.complete_fill(block);
            for waiter in waiters {
                let Waiter::Request(id) = waiter else {
                    continue;
                };
                let Some(addr) = self.requests.get(&id).map(|req| req.addr) else {
                    continue;
                };
                let violation = IntegrityViolation {
                    addr,
                    stage,
                    failed: key,
                    cause,
                };
                self.fail(id, violation.into(), now);
            }
            self.work
                .extend(stalled.into_iter().map(Work::Advance));

            if let MetaKey::Node(node) = block {
                doomed.extend(
                    self.parked
                        .remove(&node)
                        .unwrap_or_default()
                        .into_iter()
                        .map(|(child, _)| child),
                );
            }
        }
    }

    fn fail(&mut self, id: ReqId, fault: Fault, at: Tick) {
        match &fault {
            Fault::Integrity(_) => self.stats.violations += 1,
            Fault::CounterExhausted(_) => self.stats.counter_exhausted += 1,
            _ => {}
        }
        if let Some(req) = self.requests.get_mut(&id) {
            log::debug!("{id}: {fault} in state {}", req.state);
            req.state = ReqState::Violation;
        }
        self.finish(id, Err(fault), at);
    }

    fn finish(&mut self, id: ReqId, result: Result<Completion, Fault>, at: Tick) {
        let Some(req) = self.requests.remove(&id) else {
            return;
        };
        let ready_at = req.ready.max(at);
        let addr = req.addr;
        if result.is_ok() {
            self.stats.completed += 1;
        }
        self.retire(req, at);

        self.events.push_back(CpuEvent::Response(CpuResponse {
            id,
            addr,
            ready_at,
            result,
        }));
        self.grant_retry();
    }

    /// A slot in the request table has just been freed.
    fn grant_retry(&mut self) {
        if self.retry_owed {
            self.retry_owed = false;
            self.events.push_back(CpuEvent::Retry);
        }
    }

    /// Release a request's pins and let the next request to its line start.
    fn retire(&mut self, req: PendingRequest, now: Tick) {
        for key in &req.pinned {
            self.unpin(*key, now);
        }
        if let Some(next) = self.queues.remove(req.addr, req.id) {
            self.work.push_back(Work::Start(next));
        }
    }

    fn probe(&mut self, key: MetaKey) -> bool {
        match key {
            MetaKey::Counter(addr) => self.counters.store_mut().probe(&addr),
            MetaKey::Mac(addr) => self.macs.store_mut().probe(&addr),
            MetaKey::Node(node) => self.tree.store_mut().probe(&node),
        }
    }

    fn pin(&mut self, key: MetaKey) -> bool {
        match key {
            MetaKey::Counter(addr) => self.counters.store_mut().pin(&addr),
            MetaKey::Mac(addr) => self.macs.store_mut().pin(&addr),
            MetaKey::Node(node) => self.tree.store_mut().pin(&node),
        }
    }

    fn unpin(&mut self, key: MetaKey, now: Tick) {
        let writebacks: Vec<(MetaKey, Line)> = match key {
            MetaKey::Counter(addr) => self
                .counters
                .store_mut()
                .unpin(&addr)
                .into_iter()
                .map(|(addr, line)| (MetaKey::Counter(addr), line))
                .collect(),
            MetaKey::Mac(addr) => self
                .macs
                .store_mut()
                .unpin(&addr)
                .into_iter()
                .map(|(addr, line)| (MetaKey::Mac(addr), line))
                .collect(),
            MetaKey::Node(node) => self
                .tree
                .store_mut()
                .unpin(&node)
                .into_iter()
                .map(|(node, line)| (MetaKey::Node(node), line))
                .collect(),
        };
        self.send_writebacks(writebacks, now);
    }

    fn request_fill(&mut self, key: MetaKey, waiter: Waiter) -> FillAction {
        match key {
            MetaKey::Counter(addr) => self.counters.store_mut().request_fill(addr, waiter),
            MetaKey::Mac(addr) => self.macs.store_mut().request_fill(addr, waiter),
            MetaKey::Node(node) => self.tree.store_mut().request_fill(node, waiter),
        }
    }

    fn complete_fill(&mut self, key: MetaKey) -> (Vec<Waiter>, Vec<ReqId>) {
        match key {
            MetaKey::Counter(addr) => {
                let store = self.counters.store_mut();
                (store.complete_fill(&addr), store.take_stalled())
            }
            MetaKey::Mac(addr) => {
                let store = self.macs.store_mut();
                (store.complete_fill(&addr), store.take_stalled())
            }
            MetaKey::Node(node) => {
                let store = self.tree.store_mut();
                (store.complete_fill(&node), store.take_stalled())
            }
        }
    }

    fn send(&mut self, port: PortId, addr: BlockAddr, cmd: MemCmd, ready_at: Tick, what: Outstanding) {
        let id = PacketId(self.next_packet);
        self.next_packet += 1;
        self.outstanding.insert(id, what);
        self.outbox.push(MemPacket {
            id,
            port,
            addr,
            cmd,
            ready_at,
        });
    }

    fn send_fill(&mut self, key: MetaKey, now: Tick) {
        let kind = key.kind();
        let ready_at = now + self.cache_config(kind).tag_latency;
        self.send(
            PortId::for_meta(kind, self.config.ports),
            self.geo.meta_addr(key),
            MemCmd::Read,
            ready_at,
            Outstanding::Fill(key),
        );
    }

    fn send_writebacks(&mut self, writebacks: Vec<(MetaKey, Line)>, now: Tick) {
        for (key, line) in writebacks {
            log::trace!("Writing back {key}");
            self.send(
                PortId::for_meta(key.kind(), self.config.ports),
                self.geo.meta_addr(key),
                MemCmd::Write(line),
                now,
                Outstanding::Writeback(key),
            );
        }
    }
}

/// Ciphertext carried by a data read response. A response without data reads
/// as an all-zero line, which then fails the tag check.
fn data_line(response: &MemResponse) -> Line {
    response.data.unwrap_or_else(|| {
        log::warning!("Read response for {} carries no data", response.addr);
        [0; LINE_BYTES]
    })
}
