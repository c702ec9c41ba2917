// SPDX-FileCopyrightText: 2025 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

mod cli;
mod commands;
mod table;

use std::error::Error;

use self::commands::attack;
use self::commands::provision;
use self::commands::run;

fn main() -> Result<(), Box<dyn Error>> {
    let cli = cli::parse();

    #[cfg(feature = "log")]
    {
        use secctrl::log::tracing_internal as tracing;

        let subscriber_builder = tracing_subscriber::fmt()
            .without_time()
            .with_max_level(cli.log_level);

        match cli.log_json_file {
            Some(log_json_file) => {
                let file = std::fs::File::create(log_json_file)?;
                let subscriber = subscriber_builder.json().with_writer(file).finish();
                tracing::subscriber::set_global_default(subscriber)?;
            }

            None => {
                let subscriber = subscriber_builder.with_writer(std::io::stderr).finish();
                tracing::subscriber::set_global_default(subscriber)?;
            }
        }
    }

    match cli.command {
        cli::Mode::Provision(opts) => provision(opts),
        cli::Mode::Run(opts) => run(opts),
        cli::Mode::Attack(opts) => attack(opts),
    }
}
