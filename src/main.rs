// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::error::Error;
use std::process;

use anyhow::Context;
use env_logger::Env;
use log::info;
use nbd_server::{cli, run_server, Listener, ServerConfig};

// Prints `err` followed by each of its causes.
fn print_error_chain(err: &dyn Error) {
    eprintln!("Error: nbd-server exited with the following error:");
    for (level, cause) in std::iter::successors(Some(err), |e| (*e).source()).enumerate() {
        eprintln!("  {level}: {cause}");
    }
}

fn run(config: &ServerConfig) -> anyhow::Result<()> {
    let listener = Listener::bind(config).context("Failed to start listening")?;
    if let Some(addr) = listener.local_addr() {
        info!("Listening on {addr}");
    }

    run_server(config, listener).with_context(|| format!("Failed to serve {}", config.file))
}

fn main() {
    let matches = cli().get_matches();
    let config = match ServerConfig::from_matches(&matches) {
        Ok(config) => config,
        Err(e) => {
            print_error_chain(&e);
            process::exit(1);
        }
    };

    let default_filter = if config.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    if let Err(e) = run(&config) {
        print_error_chain(&*e);
        process::exit(1);
    }
}
