// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::error::Error;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use secctrl::controller::stats::Stats;
use secctrl::fault::RequestError;
use secctrl::port::Completion;
use secctrl::port::CpuRequest;
use secctrl::port::ReqId;
use secctrl::sim::Simulation;
use secctrl::BlockAddr;
use secctrl::Line;
use secctrl::LINE_BYTES;
use serde::Serialize;

use super::simulation;
use crate::cli::RunOptions;
use crate::table;

/// Outcome of a workload run
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub ticks: u64,
    pub issued: usize,
    pub completed: usize,
    /// Reads that returned something other than the last value written
    pub mismatches: usize,
    pub faults: usize,
    pub root: String,
    pub stats: Stats,
}

struct Workload {
    rng: StdRng,
    lines: u64,
    write_ratio: f64,
    /// Latest value written to each line, in issue order
    shadow: HashMap<BlockAddr, Line>,
}

impl Workload {
    /// Next request, with the line a read is expected to return
    fn next(&mut self) -> (CpuRequest, Option<Line>) {
        let addr = BlockAddr::from_line_index(self.rng.gen_range(0..self.lines));
        if self.rng.gen_bool(self.write_ratio) {
            let mut line = [0u8; LINE_BYTES];
            self.rng.fill(&mut line[..]);
            self.shadow.insert(addr, line);
            (CpuRequest::write(addr.get(), line), None)
        } else {
            let expected = self.shadow.get(&addr).copied().unwrap_or([0; LINE_BYTES]);
            (CpuRequest::read(addr.get()), Some(expected))
        }
    }
}

pub fn run(opts: RunOptions) -> Result<(), Box<dyn Error>> {
    let mut sim = simulation(&opts.common)?;
    let data_lines = sim.controller().geometry().data_lines();
    let mut workload = Workload {
        rng: StdRng::seed_from_u64(opts.common.seed),
        lines: opts.lines.unwrap_or(data_lines).clamp(1, data_lines),
        write_ratio: opts.write_ratio,
        shadow: HashMap::new(),
    };

    let report = drive(&mut sim, &mut workload, &opts)?;

    if opts.pretty {
        println!("{}", table::stats_table(&report.stats));
    }
    println!(
        "{} requests in {} ticks: {} completed, {} faults, {} mismatches",
        report.issued, report.ticks, report.completed, report.faults, report.mismatches
    );
    println!("Root: {}", report.root);

    if let Some(path) = &opts.stats_file {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &report)?;
    }

    if report.mismatches > 0 {
        return Err(format!("{} reads returned stale or corrupt data", report.mismatches).into());
    }
    Ok(())
}

fn drive(
    sim: &mut Simulation,
    workload: &mut Workload,
    opts: &RunOptions,
) -> Result<RunReport, Box<dyn Error>> {
    let mut outstanding: HashMap<ReqId, Option<Line>> = HashMap::new();
    let mut issued = 0;
    let mut completed = 0;
    let mut mismatches = 0;
    let mut faults = 0;

    loop {
        while issued < opts.requests && outstanding.len() < opts.depth.max(1) {
            let (request, expected) = workload.next();
            match sim.issue(request) {
                Ok(id) => {
                    outstanding.insert(id, expected);
                    issued += 1;
                }
                Err(RequestError::Busy) => break,
                Err(err) => return Err(err.into()),
            }
        }

        let progressed = sim.step();

        outstanding.retain(|id, expected| {
            let Some(response) = sim.take_completion(*id) else {
                return true;
            };
            match (response.result, expected) {
                (Ok(Completion::Read(line)), Some(expected)) if line != *expected => {
                    eprintln!("{id}: read of {} returned unexpected data", response.addr);
                    mismatches += 1;
                }
                (Ok(_), _) => completed += 1,
                (Err(fault), _) => {
                    eprintln!("{id}: {fault}");
                    faults += 1;
                }
            }
            false
        });

        if !progressed {
            if issued == opts.requests && outstanding.is_empty() {
                break;
            }
            if !outstanding.is_empty() {
                return Err(format!("{} requests never completed", outstanding.len()).into());
            }
        }
    }

    sim.writeback_all();
    if sim.memory_root() != sim.controller().root() {
        return Err("Root rebuilt from memory differs from the on-chip root".into());
    }

    Ok(RunReport {
        ticks: sim.now(),
        issued,
        completed,
        mismatches,
        faults,
        root: sim.controller().root().to_hex(),
        stats: sim.controller().stats(),
    })
}
