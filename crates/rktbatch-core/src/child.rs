//! Child process controller.
//!
//! Spawns the job's program (or the user's login shell) in its own process
//! group with stdin/stdout/stderr bound to the descriptors in a [`StdioMap`],
//! signals that group, and reaps the child exactly once.

use std::ffi::OsString;
use std::os::fd::OwnedFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::env;
use crate::error::{Error, Result};

/// Exit code a shell reports for a process killed by SIGTERM.
pub const SIGTERM_EXIT: i32 = 128 + Signal::SIGTERM as i32;

/// Descriptors the child receives as fd 0, 1 and 2.
#[derive(Debug)]
pub struct StdioMap {
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launch {
    /// `argv[0]` is the program, looked up on `PATH`.
    Program(Vec<String>),
    /// The invoking user's login shell, started in login mode.
    LoginShell,
}

impl Launch {
    /// An empty argument list means the login shell.
    pub fn from_argv(argv: Vec<String>) -> Self {
        if argv.is_empty() {
            Self::LoginShell
        } else {
            Self::Program(argv)
        }
    }
}

/// `argv[0]` for a login shell: the shell's file name prefixed with `-`.
pub fn login_argv0(shell: &Path) -> OsString {
    let mut argv0 = OsString::from("-");
    argv0.push(shell.file_name().unwrap_or(shell.as_os_str()));
    argv0
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
}

impl Termination {
    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signal)) => Self::Signaled(signal),
            // Stopped/continued statuses are never returned by wait().
            (None, None) => Self::Exited(1),
        }
    }

    /// Shell-style code: the exit code, or 128 + signal number.
    pub const fn shell_code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signal) => 128 + signal,
        }
    }

    /// The job's return code. SIGTERM (an operator stop) counts as success.
    ///
    /// This keeps the historical batch runner behaviour: a job stopped by the
    /// operator and one that succeeded are indistinguishable to the caller.
    pub const fn return_code(self) -> i32 {
        match self.shell_code() {
            SIGTERM_EXIT => 0,
            code => code,
        }
    }
}

/// Handle for signalling the child's process group from another thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup(Pid);

impl ProcessGroup {
    pub const fn id(self) -> Pid {
        self.0
    }

    /// Send `signal` to every process in the group.
    pub fn signal(self, signal: Signal) -> Result<()> {
        debug!(pgid = self.0.as_raw(), %signal, "Signalling process group");
        killpg(self.0, signal).map_err(|source| Error::Kill {
            pgid: self.0.as_raw(),
            source,
        })
    }
}

enum State {
    Running(Child),
    Reaped(Termination),
}

/// A spawned child: RUNNING until [`ChildProcess::reap`], then REAPED.
pub struct ChildProcess {
    program: String,
    group: ProcessGroup,
    state: State,
}

impl std::fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcess")
            .field("program", &self.program)
            .field("group", &self.group)
            .field("reaped", &matches!(self.state, State::Reaped(_)))
            .finish()
    }
}

impl ChildProcess {
    /// Spawn `launch` with environment `envp` and standard streams `stdio`.
    ///
    /// The child gets a new process group, default signal dispositions and an
    /// empty signal mask. `stdio` is consumed; the parent's copies are closed
    /// once the child has them.
    pub fn spawn(launch: &Launch, envp: &[String], stdio: StdioMap) -> Result<Self> {
        let (mut command, program) = match launch {
            Launch::Program(argv) => {
                let Some((program, args)) = argv.split_first() else {
                    return Err(Error::Spawn {
                        program: String::new(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            "empty argument list",
                        ),
                    });
                };
                let mut command = Command::new(program);
                command.args(args);
                info!(program = %program, ?args, "Running program");
                (command, program.clone())
            }
            Launch::LoginShell => {
                let user = env::login_user()?;
                info!(user = %user.name, shell = %user.shell.display(), "No program specified; spawning login shell");
                let mut command = Command::new(&user.shell);
                command.arg0(login_argv0(&user.shell));
                (command, user.shell.display().to_string())
            }
        };

        command.env_clear();
        for entry in envp {
            match env::split_entry(entry) {
                Some((key, value)) => {
                    command.env(key, value);
                }
                None => warn!(entry = %entry, "Skipping malformed environment entry"),
            }
        }
        command
            .stdin(Stdio::from(stdio.stdin))
            .stdout(Stdio::from(stdio.stdout))
            .stderr(Stdio::from(stdio.stderr))
            .process_group(0);

        let child = command.spawn().map_err(|source| Error::Spawn {
            program: program.clone(),
            source,
        })?;
        // Dropping the command closes the parent's copies of the child's ends.
        drop(command);

        let pid = i32::try_from(child.id()).map_err(|_| Error::Spawn {
            program: program.clone(),
            source: std::io::Error::other("pid out of range"),
        })?;
        debug!(program = %program, pid, "Child spawned");
        Ok(Self {
            program,
            group: ProcessGroup(Pid::from_raw(pid)),
            state: State::Running(child),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub const fn group(&self) -> ProcessGroup {
        self.group
    }

    pub const fn is_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    /// Signal the child's process group. A reaped child is left alone.
    pub fn terminate(&self, signal: Signal) -> Result<()> {
        match self.state {
            State::Running(_) => self.group.signal(signal),
            State::Reaped(_) => {
                debug!(program = %self.program, %signal, "Child already reaped; not signalling");
                Ok(())
            }
        }
    }

    /// Block until the child has terminated. Reaping twice returns the
    /// recorded status without waiting again.
    pub fn reap(&mut self) -> Result<Termination> {
        let termination = match &mut self.state {
            State::Reaped(termination) => return Ok(*termination),
            State::Running(child) => {
                let status = child.wait().map_err(|source| Error::Wait {
                    program: self.program.clone(),
                    source,
                })?;
                Termination::from_status(status)
            }
        };
        debug!(program = %self.program, ?termination, "Child reaped");
        self.state = State::Reaped(termination);
        Ok(termination)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::handle::{End, Pipe};
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> Launch {
        Launch::Program(vec!["/bin/sh".into(), "-c".into(), script.into()])
    }

    /// Child stdio wired to throwaway pipes; the parent ends are returned.
    fn stdio() -> (StdioMap, [Pipe; 3]) {
        let pipes = [
            Pipe::new("stdin").unwrap(),
            Pipe::new("stdout").unwrap(),
            Pipe::new("stderr").unwrap(),
        ];
        let map = StdioMap {
            stdin: pipes[0].dup(End::Read).unwrap(),
            stdout: pipes[1].dup(End::Write).unwrap(),
            stderr: pipes[2].dup(End::Write).unwrap(),
        };
        (map, pipes)
    }

    #[test]
    fn exit_code_is_propagated() {
        let (map, _pipes) = stdio();
        let mut child = ChildProcess::spawn(&sh("exit 3"), &[], map).unwrap();
        let termination = child.reap().unwrap();
        assert_eq!(termination, Termination::Exited(3));
        assert_eq!(termination.return_code(), 3);
    }

    #[test]
    fn exit_143_is_normalized_to_success() {
        let (map, _pipes) = stdio();
        let mut child = ChildProcess::spawn(&sh("exit 143"), &[], map).unwrap();
        assert_eq!(child.reap().unwrap().return_code(), 0);
    }

    #[test]
    fn death_by_other_signal_is_a_failure() {
        let (map, _pipes) = stdio();
        let mut child = ChildProcess::spawn(&sh("kill -KILL $$"), &[], map).unwrap();
        let termination = child.reap().unwrap();
        assert_eq!(termination, Termination::Signaled(9));
        assert_eq!(termination.return_code(), 137);
    }

    #[test]
    fn terminate_signals_whole_group() {
        let (map, _pipes) = stdio();
        // The inner sleep is a grandchild in the same group.
        let mut child = ChildProcess::spawn(&sh("sleep 30 & wait"), &[], map).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        child.terminate(Signal::SIGTERM).unwrap();
        let termination = child.reap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(termination.shell_code(), SIGTERM_EXIT);
        assert_eq!(termination.return_code(), 0);
    }

    #[test]
    fn reap_twice_returns_recorded_status() {
        let (map, _pipes) = stdio();
        let mut child = ChildProcess::spawn(&sh("exit 5"), &[], map).unwrap();
        assert!(child.is_running());
        let first = child.reap().unwrap();
        assert!(!child.is_running());
        assert_eq!(child.reap().unwrap(), first);
        // Terminating a reaped child is a no-op.
        child.terminate(Signal::SIGTERM).unwrap();
    }

    #[test]
    fn child_sees_only_the_given_environment() {
        let (map, pipes) = stdio();
        let envp = vec!["ONLY=this".to_string(), "ONLY=that".to_string()];
        let mut child =
            ChildProcess::spawn(&sh("echo \"$ONLY:${HOME:-unset}\""), &envp, map).unwrap();
        child.reap().unwrap();
        let mut buf = [0u8; 64];
        let n = pipes[1].read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"that:unset\n");
    }

    #[test]
    fn spawn_failure_names_the_program() {
        let (map, _pipes) = stdio();
        let launch = Launch::Program(vec!["/nonexistent/program".into()]);
        let err = ChildProcess::spawn(&launch, &[], map).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/program"), "{err}");
    }

    #[test]
    fn empty_argv_means_login_shell() {
        assert_eq!(Launch::from_argv(Vec::new()), Launch::LoginShell);
        assert_eq!(
            Launch::from_argv(vec!["ls".into()]),
            Launch::Program(vec!["ls".into()])
        );
        assert_eq!(login_argv0(Path::new("/bin/bash")), OsString::from("-bash"));
    }
}
