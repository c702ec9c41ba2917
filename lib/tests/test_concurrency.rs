// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

mod common;

use std::collections::HashMap;

use common::*;
use proptest::prelude::*;
use secctrl::controller::request::ReqState;
use secctrl::fault::CancelError;
use secctrl::fault::RequestError;
use secctrl::image::provision;
use secctrl::port::Completion;
use secctrl::port::CpuRequest;
use secctrl::port::ReqId;
use secctrl::sim::SimpleMemory;
use secctrl::sim::Simulation;
use secctrl::SecCtrl;
use secctrl::SecCtrlConfig;

/// Simulation whose memory answers with seeded random latency
fn jittery(config: SecCtrlConfig, seed: u64) -> Simulation {
    let provisioned = provision(&config).unwrap();
    let ctrl = SecCtrl::new(config, provisioned.root).unwrap();
    let mem = SimpleMemory::new(provisioned.image, MEM_LATENCY).with_jitter(60, seed);
    Simulation::new(ctrl, mem)
}

#[test]
fn concurrent_writes_lose_nothing() {
    for seed in 0..4 {
        let mut sim = jittery(small_config(), seed);
        let lines: Vec<u64> = (0..48).map(|i| i * 21 % 1024).collect();
        let ids: Vec<ReqId> = lines
            .iter()
            .map(|&line| {
                sim.issue(CpuRequest::write(line_addr(line), pattern(line)))
                    .unwrap()
            })
            .collect();
        sim.run_until_idle();

        for id in ids {
            assert_eq!(sim.take_completion(id).unwrap().result, Ok(Completion::Write));
        }
        for &line in &lines {
            assert_eq!(sim.read(line_addr(line)).unwrap(), pattern(line));
        }

        // Once quiescent and flushed, memory alone yields the on-chip root
        sim.writeback_all();
        assert!(sim.controller().is_idle());
        assert_eq!(sim.memory_root(), sim.controller().root());
    }
}

#[test]
fn lazy_write_back_defers_tree_updates() {
    let mut sim = simulation(small_config());
    sim.write(line_addr(9), pattern(9)).unwrap();
    assert_ne!(sim.memory_root(), sim.controller().root());
    sim.writeback_all();
    assert_eq!(sim.memory_root(), sim.controller().root());
}

#[test]
fn same_line_requests_run_in_order() {
    let mut sim = jittery(small_config(), 7);
    let addr = line_addr(77);
    let requests = [
        CpuRequest::write(addr, pattern(1)),
        CpuRequest::read(addr),
        CpuRequest::write(addr, pattern(2)),
        CpuRequest::write(addr, pattern(3)),
        CpuRequest::read(addr),
    ];
    let ids: Vec<_> = requests
        .into_iter()
        .map(|request| sim.issue(request).unwrap())
        .collect();
    assert_eq!(sim.controller().request_state(ids[4]), Some(ReqState::Queued));
    sim.run_until_idle();

    let responses: Vec<_> = ids
        .iter()
        .map(|id| sim.take_completion(*id).unwrap())
        .collect();
    assert_eq!(responses[1].result, Ok(Completion::Read(pattern(1))));
    assert_eq!(responses[4].result, Ok(Completion::Read(pattern(3))));
    for pair in responses.windows(2) {
        assert!(pair[0].ready_at <= pair[1].ready_at);
    }
}

#[test]
fn full_table_asks_for_retry() {
    let config = SecCtrlConfig {
        max_pending: 2,
        ..small_config()
    };
    let mut sim = simulation(config);
    sim.issue(CpuRequest::read(line_addr(0))).unwrap();
    sim.issue(CpuRequest::read(line_addr(500))).unwrap();
    assert_eq!(
        sim.issue(CpuRequest::read(line_addr(900))),
        Err(RequestError::Busy)
    );
    assert_eq!(sim.retries(), 0);

    sim.run_until_idle();
    assert_eq!(sim.retries(), 1);
    assert!(sim.issue(CpuRequest::read(line_addr(900))).is_ok());
    sim.run_until_idle();
    assert_eq!(sim.controller().stats().rejected, 1);
}

#[test]
fn cancel_frees_slot_for_retry() {
    let config = SecCtrlConfig {
        max_pending: 1,
        ..small_config()
    };
    let mut sim = simulation(config);
    let first = sim.issue(CpuRequest::read(line_addr(0))).unwrap();
    assert_eq!(
        sim.issue(CpuRequest::read(line_addr(500))),
        Err(RequestError::Busy)
    );

    sim.cancel(first).unwrap();
    assert_eq!(sim.retries(), 1);
    sim.run_until_idle();
    assert_eq!(sim.retries(), 1);

    let second = sim.issue(CpuRequest::read(line_addr(500))).unwrap();
    sim.run_until_idle();
    let response = sim.take_completion(second).unwrap();
    assert_eq!(response.result, Ok(Completion::Read([0; 64])));
    assert!(sim.take_completion(first).is_none());
    assert_eq!(sim.controller().stats().cancelled, 1);
}

#[test]
fn cancellation_before_crypto_only() {
    let mut sim = simulation(small_config());
    let addr = line_addr(12);

    // A cold read is still fetching metadata
    let cold = sim.issue(CpuRequest::read(addr)).unwrap();
    assert!(matches!(
        sim.controller().request_state(cold),
        Some(ReqState::Lookup | ReqState::Verify)
    ));
    let queued = sim.issue(CpuRequest::read(addr)).unwrap();
    assert_eq!(sim.controller().request_state(queued), Some(ReqState::Queued));

    let now = sim.now();
    sim.controller_mut().cancel(queued, now).unwrap();
    sim.controller_mut().cancel(cold, now).unwrap();
    assert_eq!(
        sim.controller_mut().cancel(cold, now),
        Err(CancelError::Unknown)
    );
    sim.run_until_idle();
    assert!(sim.take_completion(cold).is_none());
    assert!(sim.controller().is_idle());

    // With everything cached, a write reaches commit immediately
    sim.write(addr, pattern(4)).unwrap();
    let write = sim.issue(CpuRequest::write(addr, pattern(5))).unwrap();
    assert_eq!(sim.controller().request_state(write), Some(ReqState::Commit));
    let now = sim.now();
    assert_eq!(
        sim.controller_mut().cancel(write, now),
        Err(CancelError::TooLate)
    );
    sim.run_until_idle();
    assert_eq!(sim.read(addr).unwrap(), pattern(5));
    assert_eq!(sim.controller().stats().cancelled, 2);
}

#[test]
fn mshr_pressure_stalls_but_completes() {
    let mut config = starved_config();
    for cache in [&mut config.counter_cache, &mut config.mac_cache, &mut config.tree_cache] {
        cache.mshrs = 1;
        cache.tgts_per_mshr = 1;
    }
    let mut sim = jittery(config, 3);
    let ids: Vec<_> = (0..16)
        .map(|i| sim.issue(CpuRequest::write(line_addr(i * 61), pattern(i))).unwrap())
        .collect();
    sim.run_until_idle();
    for id in ids {
        assert_eq!(sim.take_completion(id).unwrap().result, Ok(Completion::Write));
    }
    for i in 0..16 {
        assert_eq!(sim.read(line_addr(i * 61)).unwrap(), pattern(i));
    }
    let stats = sim.controller().stats();
    assert!(stats.counter.stalls + stats.mac.stalls + stats.tree.stalls > 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn interleaved_workload_matches_program_order(
        ops in prop::collection::vec((0u64..12, prop::option::of(any::<u16>())), 1..40),
        seed: u64,
        starved: bool,
    ) {
        let config = if starved { starved_config() } else { small_config() };
        let mut sim = jittery(config, seed);
        let mut shadow: HashMap<u64, u64> = HashMap::new();
        let mut expected = Vec::new();

        for (line, value) in ops {
            // Spread the lines over different counter blocks and tree paths
            let addr = line_addr(line * 83 % 1024);
            let id = match value {
                Some(value) => {
                    shadow.insert(addr, value as u64);
                    sim.issue(CpuRequest::write(addr, pattern(value as u64))).unwrap()
                }
                None => sim.issue(CpuRequest::read(addr)).unwrap(),
            };
            let read_back = match value {
                Some(_) => Completion::Write,
                None => Completion::Read(shadow.get(&addr).map_or([0; 64], |v| pattern(*v))),
            };
            expected.push((id, read_back));
        }
        sim.run_until_idle();

        for (id, completion) in expected {
            let response = sim.take_completion(id).unwrap();
            prop_assert_eq!(response.result, Ok(completion));
        }
        sim.writeback_all();
        prop_assert_eq!(sim.memory_root(), sim.controller().root());
    }
}
