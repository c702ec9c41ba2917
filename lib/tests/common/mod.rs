// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

use secctrl::config::CacheConfig;
use secctrl::sim::Simulation;
use secctrl::BlockAddr;
use secctrl::Line;
use secctrl::SecCtrlConfig;

/// Memory latency used by the tests
pub const MEM_LATENCY: u64 = 40;

/// 1024 protected lines under a 4-ary tree of height 4
pub fn small_config() -> SecCtrlConfig {
    SecCtrlConfig {
        data_bytes: 64 * 1024,
        tree_arity: 4,
        ..SecCtrlConfig::default()
    }
}

/// Caches of `entries` lines, organised in `assoc`-way sets
pub fn tiny_cache(entries: u64, assoc: u32) -> CacheConfig {
    CacheConfig {
        size_bytes: entries * 64,
        assoc,
        ..CacheConfig::default()
    }
}

/// Configuration whose metadata caches are far smaller than the working set
pub fn starved_config() -> SecCtrlConfig {
    SecCtrlConfig {
        counter_cache: tiny_cache(2, 1),
        mac_cache: tiny_cache(2, 2),
        tree_cache: tiny_cache(2, 2),
        ..small_config()
    }
}

pub fn simulation(config: SecCtrlConfig) -> Simulation {
    Simulation::provisioned(config, MEM_LATENCY).unwrap()
}

/// Recognisable line contents
pub fn pattern(seed: u64) -> Line {
    let mut line = [0u8; 64];
    for (i, byte) in line.iter_mut().enumerate() {
        *byte = (seed as u8).wrapping_mul(31).wrapping_add(i as u8) ^ (seed >> 8) as u8;
    }
    line[..8].copy_from_slice(&seed.to_le_bytes());
    line
}

pub fn line_addr(index: u64) -> u64 {
    BlockAddr::from_line_index(index).get()
}
