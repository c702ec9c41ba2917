// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

use std::error::Error;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use secctrl::fault::IntegrityViolation;
use secctrl::sim::SimError;
use secctrl::sim::Simulation;
use secctrl::BlockAddr;
use secctrl::Fault;
use secctrl::LINE_BYTES;

use super::simulation;
use crate::cli::AttackOptions;
use crate::cli::Target;
use crate::table;

/// What was done to memory and what the controller made of it
#[derive(Debug)]
pub struct Outcome {
    pub tampered: String,
    pub violation: Option<IntegrityViolation>,
}

pub fn attack(opts: AttackOptions) -> Result<(), Box<dyn Error>> {
    let mut rng = StdRng::seed_from_u64(opts.common.seed);
    let mut outcomes = Vec::with_capacity(opts.targets.len());

    for &target in &opts.targets {
        let mut sim = simulation(&opts.common)?;
        let data_lines = sim.controller().geometry().data_lines();
        if opts.line >= data_lines {
            return Err(format!("Line {} is outside the {data_lines} protected lines", opts.line).into());
        }
        let addr = BlockAddr::from_line_index(opts.line);
        outcomes.push((target, attack_one(&mut sim, target, addr, &mut rng)?));
    }

    println!("{}", table::attack_table(&outcomes));

    let missed = outcomes
        .iter()
        .filter(|(_, outcome)| outcome.violation.is_none())
        .count();
    if missed > 0 {
        return Err(format!("{missed} attacks went undetected").into());
    }
    Ok(())
}

fn attack_one(
    sim: &mut Simulation,
    target: Target,
    addr: BlockAddr,
    rng: &mut StdRng,
) -> Result<Outcome, Box<dyn Error>> {
    let geo = sim.controller().geometry().clone();
    let (counter_block, counter_slot) = geo.counter_slot(addr);
    let (mac_block, mac_slot) = geo.mac_slot(addr);

    let mut first = [0u8; LINE_BYTES];
    rng.fill(&mut first[..]);
    sim.write(addr.get(), first)?;

    let tampered = match target {
        Target::Replay => {
            sim.writeback_all();
            let stale: Vec<_> = [addr, counter_block, mac_block]
                .into_iter()
                .filter_map(|block| Some((block, sim.memory().peek(block)?)))
                .collect();

            let mut second = [0u8; LINE_BYTES];
            rng.fill(&mut second[..]);
            sim.write(addr.get(), second)?;
            sim.invalidate_all();

            for (block, line) in &stale {
                sim.memory_mut().poke(*block, line);
            }
            format!("restored {} stale lines", stale.len())
        }

        Target::Data | Target::Counter | Target::Mac | Target::Node => {
            sim.invalidate_all();
            let byte = match target {
                Target::Data => addr.get() + rng.gen_range(0..LINE_BYTES as u64),
                Target::Counter => {
                    let width = geo.counter_bytes();
                    counter_block.get() + (counter_slot * width) as u64 + rng.gen_range(0..width as u64)
                }
                Target::Mac => {
                    let width = geo.tag_bytes();
                    mac_block.get() + (mac_slot * width) as u64 + rng.gen_range(0..width as u64)
                }
                _ => {
                    let node = geo
                        .path(counter_block)
                        .first()
                        .copied()
                        .ok_or("Tree has no nodes")?;
                    geo.node_addr(node).get() + rng.gen_range(0..LINE_BYTES as u64)
                }
            };
            let bit = rng.gen_range(0..8u8);
            let before = peek_byte(sim, byte);
            sim.memory_mut().flip_bit(byte, bit);
            let after = peek_byte(sim, byte);
            format!(
                "bit {bit} of {byte:#x} ({} -> {})",
                hex::encode([before]),
                hex::encode([after])
            )
        }
    };

    let violation = match sim.read(addr.get()) {
        Ok(_) => None,
        Err(SimError::Fault(Fault::Integrity(violation))) => Some(violation),
        Err(err) => return Err(err.into()),
    };
    Ok(Outcome {
        tampered,
        violation,
    })
}

fn peek_byte(sim: &Simulation, byte: u64) -> u8 {
    let line = byte - byte % LINE_BYTES as u64;
    BlockAddr::new(line)
        .and_then(|block| sim.memory().peek(block))
        .map_or(0, |line| line[(byte % LINE_BYTES as u64) as usize])
}
