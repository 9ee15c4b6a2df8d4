/* This is part of smartblock-agent - which is under the MIT License **********/

mod arduino;
mod artifact;
mod config;
mod decompress;
mod download;
mod error;
mod interrupt;
mod logging;
mod platform;
mod process;
mod server;
mod service;
mod toolchain;
mod util;
mod workspace;

use snafu::ResultExt;
use crate::error::Result;
use log::*;

fn run(matches: &clap::ArgMatches) -> Result<()> {
    let config = config::new(matches)?;
    let shutdown = interrupt::install()?;
    let agent = service::Agent::new(&config);

    // Pipelines run on the blocking pool, so its size bounds how many
    // requests drive the toolchain at once.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.jobs)
        .build()
        .context(error::RuntimeInit{})?;
    runtime.block_on(server::serve(&config, agent, shutdown))
}

fn main() {
    let matches = config::arguments().get_matches();

    if let Err(err) = logging::init(config::log_level(&matches)) {
        eprintln!("ERROR: {}", err);
        std::process::exit(3);
    };

    match run(&matches) {
        Ok(()) => {},
        Err(err) => {
            error!("{}", err);
            std::process::exit(2);
        }
    }
}
