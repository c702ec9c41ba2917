// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

mod common;

use common::*;
use proptest::prelude::*;
use secctrl::fault::Cause;
use secctrl::fault::Fault;
use secctrl::fault::Stage;
use secctrl::geometry::MetaKey;
use secctrl::sim::SimError;
use secctrl::BlockAddr;
use secctrl::SecCtrlConfig;

#[derive(Debug, Clone, Copy)]
enum Target {
    Data,
    CounterBlock,
    MacSlot,
    /// Node on the line's path, counted from the leaf level
    PathNode(u8),
}

fn target() -> impl Strategy<Value = Target> {
    prop_oneof![
        Just(Target::Data),
        Just(Target::CounterBlock),
        Just(Target::MacSlot),
        (0u8..8).prop_map(Target::PathNode),
    ]
}

fn config() -> SecCtrlConfig {
    SecCtrlConfig {
        data_bytes: 64 * 256,
        tree_arity: 2,
        tag_bits: 32,
        ..small_config()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn single_bit_flips_are_detected(
        target in target(),
        line in 0u64..256,
        bit in 0u64..512,
        write_first: bool,
    ) {
        let mut sim = simulation(config());
        let geo = sim.controller().geometry().clone();
        let addr = BlockAddr::from_line_index(line);
        let (counter_block, _) = geo.counter_slot(addr);
        let (mac_block, mac_slot) = geo.mac_slot(addr);

        if write_first {
            sim.write(addr.get(), pattern(line)).unwrap();
        }
        sim.invalidate_all();

        let tag_bits = geo.tag_bytes() as u64 * 8;
        let (flip_at, expected) = match target {
            Target::Data => (
                addr.get() * 8 + bit,
                (Stage::Crypto, MetaKey::Mac(mac_block), Cause::TagMismatch),
            ),
            Target::CounterBlock => (
                counter_block.get() * 8 + bit,
                (Stage::TreeVerification, MetaKey::Counter(counter_block), Cause::DigestMismatch),
            ),
            Target::MacSlot => (
                mac_block.get() * 8 + mac_slot as u64 * tag_bits + bit % tag_bits,
                (Stage::Crypto, MetaKey::Mac(mac_block), Cause::TagMismatch),
            ),
            Target::PathNode(level) => {
                let path = geo.path(counter_block);
                let node = path[level as usize % path.len()];
                let cause = if node == geo.top() {
                    Cause::RootMismatch
                } else {
                    Cause::DigestMismatch
                };
                (
                    geo.node_addr(node).get() * 8 + bit,
                    (Stage::TreeVerification, MetaKey::Node(node), cause),
                )
            }
        };
        prop_assert!(sim.memory_mut().flip_bit(flip_at / 8, (flip_at % 8) as u8));

        match sim.read(addr.get()) {
            Err(SimError::Fault(Fault::Integrity(v))) => {
                prop_assert_eq!(v.addr, addr);
                prop_assert_eq!((v.stage, v.failed, v.cause), expected);
            }
            other => prop_assert!(false, "tampering with {:?} went unnoticed: {:?}", target, other),
        }

        // Undoing the flip makes the line readable again
        sim.memory_mut().flip_bit(flip_at / 8, (flip_at % 8) as u8);
        sim.invalidate_all();
        let expected_plaintext = if write_first { pattern(line) } else { [0; 64] };
        prop_assert_eq!(sim.read(addr.get()).unwrap(), expected_plaintext);
    }
}

#[test]
fn violation_spares_other_requests() {
    let mut sim = simulation(config());
    let geo = sim.controller().geometry().clone();
    let victim = BlockAddr::from_line_index(3);
    let bystander = BlockAddr::from_line_index(200);
    sim.write(bystander.get(), pattern(200)).unwrap();
    sim.invalidate_all();

    sim.memory_mut().flip_bit(victim.get(), 0);
    let bad = sim.issue(secctrl::port::CpuRequest::read(victim.get())).unwrap();
    let good = sim.issue(secctrl::port::CpuRequest::read(bystander.get())).unwrap();
    sim.run_until_idle();

    let bad = sim.take_completion(bad).unwrap();
    assert!(matches!(bad.result, Err(Fault::Integrity(_))));
    let good = sim.take_completion(good).unwrap();
    assert_eq!(good.result, Ok(secctrl::port::Completion::Read(pattern(200))));
    assert_eq!(geo.region_of(victim.get()), Some(secctrl::geometry::Region::Data));
}
