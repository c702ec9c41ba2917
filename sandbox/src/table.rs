// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::Attribute;
use comfy_table::Cell;
use comfy_table::CellAlignment;
use comfy_table::Color;
use comfy_table::ContentArrangement;
use comfy_table::Table;
use itertools::Itertools;
use secctrl::controller::stats::Stats;
use secctrl::metadata::StoreStats;

use crate::cli::Target;
use crate::commands::attack::Outcome;

fn header_cell(name: &str) -> Cell {
    Cell::new(name)
        .add_attribute(Attribute::Bold)
        .fg(Color::DarkCyan)
        .set_alignment(CellAlignment::Center)
}

fn number_cell(value: u64) -> Cell {
    Cell::new(value).set_alignment(CellAlignment::Right)
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn hit_rate(stats: &StoreStats) -> String {
    let accesses = stats.cache.hits + stats.cache.misses;
    if accesses == 0 {
        return "---".to_string();
    }
    format!("{:.1}%", 100.0 * stats.cache.hits as f64 / accesses as f64)
}

fn store_row(name: &str, stats: &StoreStats) -> Vec<Cell> {
    let numbers = [
        stats.cache.hits,
        stats.cache.misses,
        stats.cache.evictions,
        stats.cache.dirty_evictions,
        stats.cache.overflows,
        stats.fills,
        stats.writebacks,
        stats.buffer_hits,
        stats.stalls,
    ];
    std::iter::once(Cell::new(name).fg(Color::DarkGreen))
        .chain(std::iter::once(
            Cell::new(hit_rate(stats)).set_alignment(CellAlignment::Right),
        ))
        .chain(numbers.into_iter().map(number_cell))
        .collect_vec()
}

/// Per-cache statistics followed by the request totals
pub fn stats_table(stats: &Stats) -> Table {
    let mut table = new_table();
    table.set_header(
        [
            "Cache", "Hit rate", "Hits", "Misses", "Evictions", "Dirty", "Overflows", "Fills",
            "Write-backs", "Buffer hits", "Stalls",
        ]
        .into_iter()
        .map(header_cell)
        .collect_vec(),
    );
    table.add_row(store_row("counter", &stats.counter));
    table.add_row(store_row("mac", &stats.mac));
    table.add_row(store_row("tree", &stats.tree));

    table.add_row(Vec::<Cell>::new());
    let totals = [
        ("Reads", stats.reads),
        ("Writes", stats.writes),
        ("Completed", stats.completed),
        ("Violations", stats.violations),
        ("Exhausted", stats.counter_exhausted),
        ("Cancelled", stats.cancelled),
        ("Rejected", stats.rejected),
    ];
    table.add_row(
        std::iter::once(Cell::new("Requests").fg(Color::DarkGreen))
            .chain(
                totals
                    .iter()
                    .map(|(name, value)| Cell::new(format!("{name}: {value}"))),
            )
            .collect_vec(),
    );
    table
}

/// One row per attack with what the controller reported
pub fn attack_table(outcomes: &[(Target, Outcome)]) -> Table {
    let mut table = new_table();
    table.set_header(
        ["Target", "Tampered", "Detected", "Stage", "Failed block", "Cause"]
            .into_iter()
            .map(header_cell)
            .collect_vec(),
    );
    for (target, outcome) in outcomes {
        let mut row = vec![
            Cell::new(target).add_attribute(Attribute::Bold),
            Cell::new(&outcome.tampered),
        ];
        match &outcome.violation {
            Some(violation) => row.extend([
                Cell::new("yes").fg(Color::Green),
                Cell::new(violation.stage),
                Cell::new(violation.failed),
                Cell::new(violation.cause),
            ]),
            None => row.push(Cell::new("NO").fg(Color::Red).add_attribute(Attribute::Bold)),
        }
        table.add_row(row);
    }
    table
}
