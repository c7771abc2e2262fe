//! `rktbatch`
//!
//! Runs a program (or the user's login shell) as a batch job step, relaying
//! the STDIN dataset to it and its output to STDOUT/STDERR or SYSOUT.

use std::io::BufReader;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use rktbatch::cli::Args;
use rktbatch::runner::{self, Console, FATAL_EXIT};
use rktbatch_core::config::load_config;
use rktbatch_core::tracing_init::{default_filter, init_tracing};

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => args.apply(config),
        Err(e) => {
            init_tracing(&default_filter(args.early_log_level()), args.log_json);
            error!(error = %e, "Failed to load configuration");
            return exit_code(FATAL_EXIT);
        }
    };
    init_tracing(&default_filter(&config.log_level), args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        console_commands = config.console_commands,
        "Starting rktbatch"
    );

    let console: Option<Console> = config
        .console_commands
        .then(|| Box::new(BufReader::new(std::io::stdin())) as Console);

    match runner::run_job(&config, args.program, console) {
        Ok(outcome) => exit_code(outcome.return_code),
        Err(e) => {
            error!(error = %format_args!("{e:#}"), "rktbatch failed");
            exit_code(FATAL_EXIT)
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
}
