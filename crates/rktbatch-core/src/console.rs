//! Operator console listener.
//!
//! Runs on its own thread for the life of the job, reading operator commands
//! line by line. STOP terminates the child's process group and posts the
//! cancellation token, unless the token is already set (the child exited or
//! a stop is in progress). Everything else is ignored.

use std::io::{self, BufRead};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::child::ProcessGroup;
use crate::error::Result;

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// `STOP` or the short form `P`.
    Stop,
    Other(String),
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Self {
        let verb = line.trim();
        if verb.eq_ignore_ascii_case("stop") || verb.eq_ignore_ascii_case("p") {
            Self::Stop
        } else {
            Self::Other(verb.to_string())
        }
    }
}

/// Something the listener can ask to terminate.
pub trait Terminate: Send {
    fn terminate(&self, signal: Signal) -> Result<()>;
}

impl Terminate for ProcessGroup {
    fn terminate(&self, signal: Signal) -> Result<()> {
        self.signal(signal)
    }
}

/// Why the listener stopped listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    /// The console reached end of input.
    Closed,
    /// A read failed with something other than `EINTR`.
    Failed,
}

pub struct ConsoleListener<R, T> {
    console: R,
    target: T,
    token: Arc<CancelToken>,
}

impl<R, T> ConsoleListener<R, T>
where
    R: BufRead + Send + 'static,
    T: Terminate + 'static,
{
    pub const fn new(console: R, target: T, token: Arc<CancelToken>) -> Self {
        Self {
            console,
            target,
            token,
        }
    }

    /// Read commands until the console closes or fails.
    pub fn run(mut self) -> ListenerExit {
        info!("Listening for console commands");
        let mut line = String::new();
        loop {
            line.clear();
            match self.console.read_line(&mut line) {
                Ok(0) => {
                    warn!("Console closed; no longer listening for commands");
                    return ListenerExit::Closed;
                }
                Ok(_) => self.dispatch(ConsoleCommand::parse(&line)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "Console read failed; no longer listening for commands");
                    return ListenerExit::Failed;
                }
            }
        }
    }

    fn dispatch(&self, command: ConsoleCommand) {
        match command {
            ConsoleCommand::Stop => {
                // The child may already be reaped and its group id reused.
                if self.token.is_cancelled() {
                    info!("STOP command received; job is already ending");
                    return;
                }
                info!("STOP command received");
                if let Err(e) = self.target.terminate(Signal::SIGTERM) {
                    warn!(error = %e, "Failed to signal child on STOP");
                }
                self.token.cancel();
            }
            ConsoleCommand::Other(verb) => {
                debug!(command = %verb, "Ignoring unsupported console command");
            }
        }
    }

    /// Run on a named background thread. The handle may be dropped to detach.
    pub fn spawn(self) -> io::Result<JoinHandle<ListenerExit>> {
        thread::Builder::new()
            .name("console".to_string())
            .spawn(move || self.run())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Signal>>>);

    impl Terminate for Recorder {
        fn terminate(&self, signal: Signal) -> Result<()> {
            self.0.lock().unwrap().push(signal);
            Ok(())
        }
    }

    #[test]
    fn parse_recognizes_stop_spellings() {
        assert_eq!(ConsoleCommand::parse("stop\n"), ConsoleCommand::Stop);
        assert_eq!(ConsoleCommand::parse("  STOP  "), ConsoleCommand::Stop);
        assert_eq!(ConsoleCommand::parse("P"), ConsoleCommand::Stop);
        assert_eq!(
            ConsoleCommand::parse("modify x\n"),
            ConsoleCommand::Other("modify x".into())
        );
    }

    #[test]
    fn stop_terminates_and_cancels() {
        let token = Arc::new(CancelToken::new().unwrap());
        let recorder = Recorder::default();
        let console = Cursor::new("hello\nstop\n");
        let listener = ConsoleListener::new(console, recorder.clone(), Arc::clone(&token));
        assert_eq!(listener.run(), ListenerExit::Closed);
        assert_eq!(*recorder.0.lock().unwrap(), vec![Signal::SIGTERM]);
        assert!(token.is_cancelled());
    }

    #[test]
    fn other_commands_are_ignored() {
        let token = Arc::new(CancelToken::new().unwrap());
        let recorder = Recorder::default();
        let listener =
            ConsoleListener::new(Cursor::new("status\n\n"), recorder.clone(), Arc::clone(&token));
        listener.spawn().unwrap().join().unwrap();
        assert!(recorder.0.lock().unwrap().is_empty());
        assert!(!token.is_cancelled());
    }

    struct Failing;

    impl Read for Failing {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("console gone"))
        }
    }

    #[test]
    fn read_failure_ends_listener_quietly() {
        let token = Arc::new(CancelToken::new().unwrap());
        let listener = ConsoleListener::new(
            io::BufReader::new(Failing),
            Recorder::default(),
            Arc::clone(&token),
        );
        assert_eq!(listener.run(), ListenerExit::Failed);
        assert!(!token.is_cancelled());
    }

    #[test]
    fn stop_after_job_ended_signals_nothing() {
        let token = Arc::new(CancelToken::new().unwrap());
        // SIGCHLD or an earlier stop already posted the token.
        token.cancel();
        let recorder = Recorder::default();
        let listener =
            ConsoleListener::new(Cursor::new("stop\nP\n"), recorder.clone(), Arc::clone(&token));
        assert_eq!(listener.run(), ListenerExit::Closed);
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn repeated_stop_signals_once() {
        let token = Arc::new(CancelToken::new().unwrap());
        let recorder = Recorder::default();
        let listener =
            ConsoleListener::new(Cursor::new("stop\nstop\n"), recorder.clone(), Arc::clone(&token));
        listener.run();
        assert_eq!(*recorder.0.lock().unwrap(), vec![Signal::SIGTERM]);
    }

    struct FailingTarget;

    impl Terminate for FailingTarget {
        fn terminate(&self, _signal: Signal) -> Result<()> {
            Err(crate::error::Error::Kill {
                pgid: 0,
                source: nix::errno::Errno::ESRCH,
            })
        }
    }

    #[test]
    fn stop_cancels_even_when_signal_fails() {
        let token = Arc::new(CancelToken::new().unwrap());
        let listener = ConsoleListener::new(Cursor::new("p\n"), FailingTarget, Arc::clone(&token));
        listener.run();
        assert!(token.is_cancelled());
    }
}
