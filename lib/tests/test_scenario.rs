// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

mod common;

use common::*;
use secctrl::controller::SecCtrl;
use secctrl::crypto::CryptoUnit;
use secctrl::crypto::Nonce;
use secctrl::fault::Cause;
use secctrl::fault::Fault;
use secctrl::fault::Stage;
use secctrl::geometry::Geometry;
use secctrl::geometry::MetaKey;
use secctrl::image::provision;
use secctrl::metadata::counters::CounterBlock;
use secctrl::metadata::macs::MacBlock;
use secctrl::metadata::MetaBlock;
use secctrl::sim::SimError;
use secctrl::sim::SimpleMemory;
use secctrl::sim::Simulation;
use secctrl::tree;
use secctrl::BlockAddr;
use secctrl::SecCtrlConfig;

fn violation(result: Result<secctrl::Line, SimError>) -> (Stage, MetaKey, Cause) {
    match result {
        Err(SimError::Fault(Fault::Integrity(v))) => (v.stage, v.failed, v.cause),
        other => panic!("expected an integrity violation, got {other:?}"),
    }
}

#[test]
fn fresh_memory_reads_zero() {
    let mut sim = simulation(small_config());
    assert_eq!(sim.read(line_addr(0)).unwrap(), [0; 64]);
    assert_eq!(sim.read(line_addr(1023)).unwrap(), [0; 64]);
    assert!(sim.controller().is_idle());
}

#[test]
fn write_then_read_round_trips() {
    let mut sim = simulation(small_config());
    for i in 0..64 {
        sim.write(line_addr(i * 13 % 1024), pattern(i)).unwrap();
    }
    for i in 0..64 {
        assert_eq!(sim.read(line_addr(i * 13 % 1024)).unwrap(), pattern(i));
    }

    let stats = sim.controller().stats();
    assert_eq!(stats.writes, 64);
    assert_eq!(stats.reads, 64);
    assert_eq!(stats.completed, 128);
    assert_eq!(stats.violations, 0);
}

#[test]
fn replay_and_path_corruption_are_detected() {
    let mut sim = simulation(small_config());
    let geo = sim.controller().geometry().clone();
    let addr = BlockAddr::from_line_index(5);
    let (counter_block, _) = geo.counter_slot(addr);
    let (mac_block, _) = geo.mac_slot(addr);

    sim.write(addr.get(), pattern(1)).unwrap();
    assert_eq!(sim.read(addr.get()).unwrap(), pattern(1));

    // Snapshot the off-chip state of the line
    sim.invalidate_all();
    let snapshot = |sim: &Simulation| {
        [addr, counter_block, mac_block].map(|a| (a, sim.memory().peek(a).unwrap()))
    };
    let old = snapshot(&sim);

    sim.write(addr.get(), pattern(2)).unwrap();
    assert_eq!(sim.read(addr.get()).unwrap(), pattern(2));
    sim.invalidate_all();
    let current = snapshot(&sim);

    // Replaying ciphertext, tag and counter together is caught by the tree
    for (a, line) in &old {
        sim.memory_mut().poke(*a, line);
    }
    assert_eq!(
        violation(sim.read(addr.get())),
        (
            Stage::TreeVerification,
            MetaKey::Counter(counter_block),
            Cause::DigestMismatch
        )
    );

    // MAC blocks are not covered by the tree, so the replayed one is cached
    for (a, line) in &current {
        sim.memory_mut().poke(*a, line);
    }
    sim.invalidate_all();
    assert_eq!(sim.read(addr.get()).unwrap(), pattern(2));

    // Corrupt the leaf-level node on the line's path
    sim.invalidate_all();
    let leaf_node = geo.path(counter_block)[0];
    let node_addr = geo.node_addr(leaf_node).get();
    sim.memory_mut().flip_bit(node_addr + 17, 3);
    assert_eq!(
        violation(sim.read(addr.get())),
        (
            Stage::TreeVerification,
            MetaKey::Node(leaf_node),
            Cause::DigestMismatch
        )
    );
    sim.memory_mut().flip_bit(node_addr + 17, 3);

    // Corrupt the top node
    sim.invalidate_all();
    let top_addr = geo.node_addr(geo.top()).get();
    sim.memory_mut().flip_bit(top_addr, 0);
    assert_eq!(
        violation(sim.read(addr.get())),
        (
            Stage::TreeVerification,
            MetaKey::Node(geo.top()),
            Cause::RootMismatch
        )
    );
    sim.memory_mut().flip_bit(top_addr, 0);
    assert_eq!(sim.read(addr.get()).unwrap(), pattern(2));
    assert_eq!(sim.controller().stats().violations, 3);
}

#[test]
fn evicted_metadata_reads_back_last_value() {
    let mut sim = simulation(starved_config());
    let target = line_addr(7);
    sim.write(target, pattern(1)).unwrap();
    sim.write(target, pattern(2)).unwrap();

    // Sweep enough other lines to push the target's metadata out
    for i in (100..1024).step_by(37) {
        sim.write(line_addr(i), pattern(i)).unwrap();
    }
    assert_eq!(sim.read(target).unwrap(), pattern(2));
    for i in (100..1024).step_by(37) {
        assert_eq!(sim.read(line_addr(i)).unwrap(), pattern(i));
    }

    let stats = sim.controller().stats();
    assert!(stats.counter.cache.dirty_evictions > 0);
    assert!(stats.tree.cache.evictions > 0);
    assert!(stats.tree.cache.overflows > 0, "write paths exceed the tree cache");
    assert!(stats.counter.writebacks > 0);
}

#[test]
fn explicit_eviction_writes_back_dirty_metadata() {
    let mut sim = simulation(small_config());
    let addr = BlockAddr::from_line_index(5);
    sim.write(addr.get(), pattern(5)).unwrap();
    assert_eq!(sim.controller().peek_counter(addr), Some(1));

    // Counter and MAC blocks are both dirty
    assert_eq!(sim.evict_metadata(addr), 2);
    assert!(sim.controller().is_idle());
    assert_eq!(sim.controller().peek_counter(addr), None);
    assert_eq!(sim.evict_metadata(addr), 0);

    sim.writeback_all();
    assert_eq!(sim.memory_root(), sim.controller().root());
    assert_eq!(sim.read(addr.get()).unwrap(), pattern(5));
    assert_eq!(sim.controller().peek_counter(addr), Some(1));
}

#[test]
fn counters_strictly_increase() {
    let mut sim = simulation(small_config());
    let addr = BlockAddr::from_line_index(42);
    let mut ciphertexts = Vec::new();

    for i in 1..=20 {
        // Same plaintext every time
        sim.write(addr.get(), pattern(0)).unwrap();
        assert_eq!(sim.controller().peek_counter(addr), Some(i));
        ciphertexts.push(sim.memory().peek(addr).unwrap());
    }

    ciphertexts.sort();
    ciphertexts.dedup();
    assert_eq!(ciphertexts.len(), 20, "a ciphertext repeated, so did a nonce");
}

#[test]
fn exhausted_counter_refuses_writes() {
    let config = SecCtrlConfig {
        counter_bits: 16,
        ..small_config()
    };
    let geo = Geometry::new(&config).unwrap();
    let crypto = CryptoUnit::new(&config.keys, geo.tag_bytes());
    let mut image = provision(&config).unwrap().image;
    let addr = BlockAddr::from_line_index(3);
    let max = config.counter_max();

    // Forge a consistent image in which the line sits at the last counter
    let (counter_block, slot) = geo.counter_slot(addr);
    let mut counters = CounterBlock::from_line(image.read_line(counter_block).unwrap());
    counters.set_counter(slot, geo.counter_bytes(), max);
    image.write_line(counter_block, counters.as_line());

    let nonce = Nonce::new(addr, max);
    let ciphertext = crypto.encrypt(&pattern(9), nonce).unwrap();
    image.write_line(addr, &ciphertext);
    let (mac_block, slot) = geo.mac_slot(addr);
    let mut macs = MacBlock::from_line(image.read_line(mac_block).unwrap());
    macs.set_tag(slot, &crypto.tag(&ciphertext, nonce));
    image.write_line(mac_block, macs.as_line());

    let built = tree::build(&geo, |a| image.read_line(a).unwrap());
    for (node, line) in &built.nodes {
        image.write_line(geo.node_addr(*node), line);
    }

    let ctrl = SecCtrl::new(config, built.root).unwrap();
    let mut sim = Simulation::new(ctrl, SimpleMemory::new(image, MEM_LATENCY));
    assert_eq!(sim.read(addr.get()).unwrap(), pattern(9));
    assert_eq!(
        sim.write(addr.get(), pattern(10)),
        Err(SimError::Fault(Fault::CounterExhausted(addr)))
    );
    assert_eq!(sim.read(addr.get()).unwrap(), pattern(9));
    assert_eq!(sim.controller().peek_counter(addr), Some(max));
    assert_eq!(sim.controller().stats().counter_exhausted, 1);
}

#[test]
fn malformed_requests_are_rejected() {
    let mut sim = simulation(small_config());
    assert!(matches!(
        sim.read(65),
        Err(SimError::Rejected(secctrl::fault::RequestError::Misaligned(65)))
    ));
    assert!(matches!(
        sim.read(64 * 1024),
        Err(SimError::Rejected(secctrl::fault::RequestError::OutOfRange(_)))
    ));
    assert_eq!(sim.controller().addr_ranges(), vec![0..64 * 1024]);
}
