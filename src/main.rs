mod acquire;
mod args;
mod commands;
mod device;
mod shared;

use anyhow::Result;
use clap::Parser;

use args::{AppCommand, Cli};
use commands::{run_log, run_probe};

// Top-level entrypoint: parse CLI args, set up console logging, dispatch to a command module.
fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.command.verbose());
    match cli.command {
        AppCommand::Log(args) => run_log(args),
        AppCommand::Probe(args) => run_probe(args),
    }
}

// RUST_LOG wins when set; otherwise info, or debug with --verbose so every command and
// response is echoed.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}
