// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

use crate::metadata::StoreStats;

/// Controller statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Stats {
    pub reads: u64,
    pub writes: u64,
    pub completed: u64,
    pub violations: u64,
    pub counter_exhausted: u64,
    pub cancelled: u64,
    /// Requests rejected because the pending table was full
    pub rejected: u64,
    pub counter: StoreStats,
    pub mac: StoreStats,
    pub tree: StoreStats,
}
