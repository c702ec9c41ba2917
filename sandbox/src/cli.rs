// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

use std::path::Path;

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;

#[derive(Debug, Clone, Subcommand)]
pub enum Mode {
    /// Format a fresh memory image and print its root
    Provision(ProvisionOptions),
    /// Drive a random workload through the controller
    Run(RunOptions),
    /// Tamper with off-chip state and check that it is caught
    Attack(AttackOptions),
}

#[derive(Debug, Clone, Parser)]
pub struct Cli {
    /// Configure the log level
    #[cfg(feature = "log")]
    #[arg(long, default_value = "warn")]
    pub log_level: secctrl::log::tracing_internal::Level,

    /// Log to a JSON file
    #[cfg(feature = "log")]
    #[arg(long)]
    pub log_json_file: Option<Box<Path>>,

    #[command(subcommand)]
    pub command: Mode,
}

#[derive(Debug, Clone, Parser)]
pub struct CommonOptions {
    /// JSON configuration of the controller. Defaults apply when omitted.
    #[arg(long, short)]
    pub config: Option<Box<Path>>,

    /// Provisioned image to start from, as written by `provision`
    #[arg(long)]
    pub image: Option<Box<Path>>,

    /// Memory latency in ticks
    #[arg(long, default_value_t = 40)]
    pub latency: u64,

    /// Extra random memory latency in ticks
    #[arg(long, default_value_t = 0)]
    pub jitter: u64,

    /// Seed for workloads and latency jitter
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

#[derive(Debug, Clone, Parser)]
pub struct ProvisionOptions {
    /// JSON configuration of the controller. Defaults apply when omitted.
    #[arg(long, short)]
    pub config: Option<Box<Path>>,

    /// Where to write the image
    #[arg(long, short)]
    pub output: Box<Path>,
}

#[derive(Debug, Clone, Parser)]
pub struct RunOptions {
    #[command(flatten)]
    pub common: CommonOptions,

    /// Number of requests to issue
    #[arg(long, short = 'n', default_value_t = 10_000)]
    pub requests: usize,

    /// Requests kept in flight at once
    #[arg(long, default_value_t = 16)]
    pub depth: usize,

    /// Share of writes, between 0 and 1
    #[arg(long, default_value_t = 0.3, value_parser = validate_ratio)]
    pub write_ratio: f64,

    /// Restrict the workload to the first N lines of the protected region
    #[arg(long)]
    pub lines: Option<u64>,

    /// Write the statistics to a JSON file
    #[arg(long)]
    pub stats_file: Option<Box<Path>>,

    /// Pretty print the statistics in a table
    #[arg(long)]
    pub pretty: bool,
}

#[derive(Clone, Copy, ValueEnum, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Target {
    /// A data line
    Data,
    /// The counter block covering the line
    Counter,
    /// The MAC block covering the line
    Mac,
    /// The lowest tree node on the line's path
    Node,
    /// Restore a stale copy of the line and its metadata
    Replay,
}

#[derive(Debug, Clone, Parser)]
pub struct AttackOptions {
    #[command(flatten)]
    pub common: CommonOptions,

    /// What to tamper with
    #[arg(
        long,
        value_enum,
        num_args = 1..,
        default_values_t = [Target::Data, Target::Counter, Target::Mac, Target::Node, Target::Replay],
    )]
    pub targets: Vec<Target>,

    /// Data line whose state is attacked
    #[arg(long, default_value_t = 0)]
    pub line: u64,
}

/// Validator for `--write-ratio`
pub fn validate_ratio(ratio: &str) -> Result<f64, String> {
    match ratio.parse::<f64>() {
        Ok(ratio) if (0.0..=1.0).contains(&ratio) => Ok(ratio),
        Ok(ratio) => Err(format!("{ratio} is not between 0 and 1")),
        Err(err) => Err(err.to_string()),
    }
}

/// Parse the command-line arguments.
pub fn parse() -> Cli {
    Cli::parse()
}
