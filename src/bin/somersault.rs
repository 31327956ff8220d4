// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.


//! Command-line entry point for the proxy.
use std::fs::read_to_string;
use std::path::PathBuf;
use std::process::exit;
use std::sync::mpsc::channel;
use std::sync::Arc;

use clap::Parser;
use log::error;
use log::info;
use log::LevelFilter;
use somersault::pipeline::StageRegistry;
use somersault::socks5::auth::AuthMethods;
use somersault::Somersault;
use somersault::SomersaultConfig;

/// Composable tunneling proxy.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
    /// Increase logging verbosity (repeat for more).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace
    };

    env_logger::builder()
        .filter_level(level)
        .parse_default_env()
        .init()
}

fn load_config(args: &Args) -> Result<SomersaultConfig, String> {
    let text = read_to_string(&args.config).map_err(|err| {
        format!("cannot read {}: {}", args.config.display(), err)
    })?;

    serde_yaml::from_str(&text).map_err(|err| {
        format!("cannot parse {}: {}", args.config.display(), err)
    })
}

fn run(args: &Args) -> Result<(), String> {
    let config = load_config(args)?;
    let stages = StageRegistry::with_builtins(Arc::new(AuthMethods::new()))
        .map_err(|err| err.to_string())?;
    let mut somersault =
        Somersault::new(&config, &stages).map_err(|err| err.to_string())?;
    let (send, recv) = channel();

    ctrlc::set_handler(move || {
        let _ = send.send(());
    })
    .map_err(|err| format!("cannot install signal handler: {}", err))?;

    info!(target: "somersault",
          "started {} listeners",
          somersault.listeners().len());

    if recv.recv().is_err() {
        error!(target: "somersault",
               "signal handler channel closed");
    }

    info!(target: "somersault",
          "shutting down");

    somersault.close();

    Ok(())
}

fn main() {
    let args = Args::parse();

    init_logging(args.verbose);

    if let Err(err) = run(&args) {
        error!(target: "somersault",
               "{}",
               err);

        exit(1)
    }
}
