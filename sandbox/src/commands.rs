// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

pub mod attack;
pub mod provision;
pub mod run;

use std::error::Error;

use secctrl::image::provision as format_image;
use secctrl::image::Provisioned;
use secctrl::sim::SimpleMemory;
use secctrl::sim::Simulation;
use secctrl::SecCtrl;
use secctrl::SecCtrlConfig;

pub use attack::attack;
pub use provision::provision;
pub use run::run;

use crate::cli::CommonOptions;

/// Configuration selected on the command line
pub fn load_config(opts: &CommonOptions) -> Result<SecCtrlConfig, Box<dyn Error>> {
    let config = match &opts.config {
        Some(path) => SecCtrlConfig::from_json_file(path)?,
        None => SecCtrlConfig::default(),
    };
    Ok(config)
}

/// Controller and memory for the given options, from a saved image if one was
/// given and from a freshly provisioned one otherwise.
pub fn simulation(opts: &CommonOptions) -> Result<Simulation, Box<dyn Error>> {
    let config = load_config(opts)?;
    let Provisioned { root, image } = match &opts.image {
        Some(path) => Provisioned::load(path)?,
        None => format_image(&config)?,
    };

    let ctrl = SecCtrl::new(config, root)?;
    if image.size() != ctrl.geometry().memory_range().end {
        return Err(format!(
            "Image holds {} bytes but the configuration needs {}",
            image.size(),
            ctrl.geometry().memory_range().end
        )
        .into());
    }

    let mem = SimpleMemory::new(image, opts.latency).with_jitter(opts.jitter, opts.seed);
    Ok(Simulation::new(ctrl, mem))
}
