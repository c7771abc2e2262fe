//! Runs one job step: open datasets, spawn the program, relay until it ends.

use std::io::BufRead;
use std::sync::Arc;

use anyhow::Context;
use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use rktbatch_core::console::ConsoleListener;
use rktbatch_core::env::login_user;
use rktbatch_core::signals::ChildExitHook;
use rktbatch_core::{
    CancelToken, ChildProcess, Config, DdTable, JobDatasets, Launch, Relay, RelayPipes,
    RelayStats, Termination,
};

/// Exit code for a failure in the supervisor itself.
pub const FATAL_EXIT: i32 = 12;

/// Operator console source. `None` disables console commands.
pub type Console = Box<dyn BufRead + Send>;

/// How a job step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOutcome {
    pub termination: Termination,
    /// `termination` as the step's return code (SIGTERM counts as success).
    pub return_code: i32,
    pub stats: RelayStats,
}

/// Run `argv` (or the login shell when empty) as a job step.
pub fn run_job(
    config: &Config,
    argv: Vec<String>,
    console: Option<Console>,
) -> anyhow::Result<JobOutcome> {
    let table = DdTable::new(config.dd.clone());
    let JobDatasets {
        mut input,
        mut outputs,
    } = JobDatasets::open(&table).context("Failed to open job datasets")?;

    let user = login_user()?;
    let envp = table
        .env_block(&user.home)
        .context("Failed to build environment")?;

    let pipes = RelayPipes::new()?;
    let stdio = pipes.child_stdio()?;
    let mut relay = Relay::new(pipes, config.buffer_size);

    let token = Arc::new(CancelToken::new()?);
    let _hook = ChildExitHook::install(&token)?;

    let launch = Launch::from_argv(argv);
    let mut child = ChildProcess::spawn(&launch, &envp, stdio)?;

    match console {
        Some(console) if config.console_commands => {
            // Detached: the listener may block on the console past the job's end.
            ConsoleListener::new(console, child.group(), Arc::clone(&token))
                .spawn()
                .context("Failed to start console listener")?;
        }
        _ => debug!("Console commands disabled"),
    }

    let relayed = relay.run(&mut input, &mut outputs, &token);
    if let Err(e) = &relayed {
        warn!(error = %e, program = child.program(), "Relay failed; terminating child");
        if let Err(e) = child.terminate(Signal::SIGTERM) {
            warn!(error = %e, "Failed to terminate child");
        }
    }
    let termination = child.reap()?;
    let stats = relayed.with_context(|| format!("Relay for {} failed", child.program()))?;

    debug!(
        stdin_bytes = stats.stdin_bytes,
        stdout_bytes = stats.stdout_bytes,
        stderr_bytes = stats.stderr_bytes,
        "Relay statistics"
    );
    let return_code = termination.return_code();
    info!(program = child.program(), ?termination, return_code, "Job step ended");
    Ok(JobOutcome {
        termination,
        return_code,
        stats,
    })
}
