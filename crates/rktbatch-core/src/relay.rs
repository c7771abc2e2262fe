//! The relay loop between the job's datasets and the child's pipes.
//!
//! One thread multiplexes all three directions: input → child stdin,
//! child stdout → sink 1, child stderr → sink 2. Each iteration waits on
//! every open direction plus the cancellation token and moves at most one
//! buffer per ready direction, so no channel can starve the others.
//!
//! The loop ends only when the wait reports the token with nothing else
//! ready. After cancellation input is no longer fed, but output that is
//! already readable is still drained.

use std::fmt;
use std::io::ErrorKind;

use tracing::{debug, trace, warn};

use crate::cancel::{CancelToken, WaitOutcome, Watch};
use crate::child::StdioMap;
use crate::error::Result;
use crate::handle::{End, Pipe, Stream};

/// Bytes moved per transfer.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Largest single feed to the child's stdin. After `POLLOUT` a pipe accepts
/// this many bytes without blocking.
pub const MAX_FEED: usize = libc::PIPE_BUF;

/// A child output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Stderr,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Destination streams for the child's output channels.
pub trait Sinks {
    /// The stream that receives `channel`, after any fallback.
    fn sink(&mut self, channel: Channel) -> &mut Stream;

    /// Flush every distinct sink.
    fn flush(&mut self) -> Result<()>;
}

/// Byte counts moved by one relay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub stdin_bytes: u64,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
}

/// The three pipes connecting the supervisor to the child.
#[derive(Debug)]
pub struct RelayPipes {
    pub stdin: Pipe,
    pub stdout: Pipe,
    pub stderr: Pipe,
}

impl RelayPipes {
    pub fn new() -> Result<Self> {
        Ok(Self {
            stdin: Pipe::new("child stdin")?,
            stdout: Pipe::new("child stdout")?,
            stderr: Pipe::new("child stderr")?,
        })
    }

    /// Duplicate the child's ends: stdin read end, stdout/stderr write ends.
    pub fn child_stdio(&self) -> Result<StdioMap> {
        Ok(StdioMap {
            stdin: self.stdin.dup(End::Read)?,
            stdout: self.stdout.dup(End::Write)?,
            stderr: self.stderr.dup(End::Write)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slots {
    stdin: Option<usize>,
    stdout: Option<usize>,
    stderr: Option<usize>,
}

/// Relay engine. Owns the parent's pipe ends.
#[derive(Debug)]
pub struct Relay {
    pipes: RelayPipes,
    buffer: Vec<u8>,
    stats: RelayStats,
}

impl Relay {
    /// Take the pipes and close the ends the parent never uses.
    pub fn new(mut pipes: RelayPipes, buffer_size: usize) -> Self {
        pipes.stdin.close_read();
        pipes.stdout.close_write();
        pipes.stderr.close_write();
        Self {
            pipes,
            buffer: vec![0; buffer_size.max(1)],
            stats: RelayStats::default(),
        }
    }

    pub const fn pipes(&self) -> &RelayPipes {
        &self.pipes
    }

    /// Relay until the token fires with nothing left to move.
    ///
    /// `input` is closed when it reaches end of file. Sinks are flushed
    /// before returning.
    pub fn run<S>(
        &mut self,
        input: &mut Stream,
        sinks: &mut S,
        token: &CancelToken,
    ) -> Result<RelayStats>
    where
        S: Sinks + ?Sized,
    {
        loop {
            let (outcome, slots) = {
                let mut watches = Vec::with_capacity(3);
                let mut slots = Slots::default();
                if !token.is_cancelled() {
                    if let Some(fd) = self.pipes.stdin.write_fd() {
                        slots.stdin = Some(watches.len());
                        watches.push(Watch::writable(fd));
                    }
                }
                if let Some(fd) = self.pipes.stdout.read_fd() {
                    slots.stdout = Some(watches.len());
                    watches.push(Watch::readable(fd));
                }
                if let Some(fd) = self.pipes.stderr.read_fd() {
                    slots.stderr = Some(watches.len());
                    watches.push(Watch::readable(fd));
                }
                (token.wait(&watches)?, slots)
            };

            let ready = match outcome {
                WaitOutcome::Cancelled => break,
                WaitOutcome::Ready(ready) => ready,
            };
            let is_ready = |slot: Option<usize>| slot.is_some_and(|i| ready.contains(i));

            if is_ready(slots.stdin) {
                self.feed_child(input)?;
            }
            if is_ready(slots.stdout) {
                self.drain(Channel::Stdout, sinks)?;
            }
            if is_ready(slots.stderr) {
                self.drain(Channel::Stderr, sinks)?;
            }
        }

        debug!("Relay loop finished");
        sinks.flush()?;
        Ok(self.stats)
    }

    /// Move up to one buffer (capped at [`MAX_FEED`]) from `input` to the
    /// child's stdin, or propagate EOF.
    fn feed_child(&mut self, input: &mut Stream) -> Result<()> {
        let limit = self.buffer.len().min(MAX_FEED);
        let n = match input.read(&mut self.buffer[..limit]) {
            Ok(n) => n,
            Err(e) if e.io_kind() == Some(ErrorKind::UnexpectedEof) => 0,
            Err(e) => return Err(e),
        };
        trace!(bytes = n, source = input.name(), "Read input");
        if n == 0 {
            debug!("Input exhausted; closing child stdin to signal EOF");
            self.pipes.stdin.close_write();
            input.close();
            return Ok(());
        }
        match self.pipes.stdin.write(&self.buffer[..n]) {
            Ok(_) => {
                self.stats.stdin_bytes += n as u64;
                Ok(())
            }
            Err(e) if e.io_kind() == Some(ErrorKind::BrokenPipe) => {
                warn!("Child closed its stdin; input no longer relayed");
                self.pipes.stdin.close_write();
                input.close();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Move one buffer from a child output pipe to its sink.
    fn drain<S>(&mut self, channel: Channel, sinks: &mut S) -> Result<()>
    where
        S: Sinks + ?Sized,
    {
        let (pipe, counter) = match channel {
            Channel::Stdout => (&mut self.pipes.stdout, &mut self.stats.stdout_bytes),
            Channel::Stderr => (&mut self.pipes.stderr, &mut self.stats.stderr_bytes),
        };
        let n = pipe.read(&mut self.buffer)?;
        if n == 0 {
            debug!(%channel, "Child closed its end");
            pipe.close_read();
            return Ok(());
        }
        let sink = sinks.sink(channel);
        trace!(bytes = n, %channel, sink = sink.name(), "Forwarding output");
        sink.write(&self.buffer[..n])?;
        *counter += n as u64;
        Ok(())
    }
}
