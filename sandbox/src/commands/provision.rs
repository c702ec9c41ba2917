// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

use std::error::Error;

use secctrl::geometry::Geometry;
use secctrl::image;
use secctrl::SecCtrlConfig;

use crate::cli::ProvisionOptions;

pub fn provision(opts: ProvisionOptions) -> Result<(), Box<dyn Error>> {
    let config = match &opts.config {
        Some(path) => SecCtrlConfig::from_json_file(path)?,
        None => SecCtrlConfig::default(),
    };
    let geo = Geometry::new(&config)?;
    let provisioned = image::provision(&config)?;
    provisioned.save(&opts.output)?;

    println!(
        "Provisioned {} data lines, {} counter blocks, {} MAC blocks, {} tree levels ({} bytes)",
        geo.data_lines(),
        geo.counter_blocks(),
        geo.mac_blocks(),
        geo.levels(),
        provisioned.image.size()
    );
    println!("Root: {}", provisioned.root);
    Ok(())
}
