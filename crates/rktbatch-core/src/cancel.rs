//! Cancellation token and the multiplexed wait that observes it.
//!
//! The token is a flag plus a self-pipe. Posting stores the flag and writes
//! one byte into the pipe; the byte is never drained, so every wait that
//! starts after a post, or is already blocked when it happens, returns.
//! Posting is async-signal-safe and may run inside a signal handler.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::unistd;
use tracing::debug;

use crate::error::{Error, Result};

/// Which readiness a watched descriptor is waited for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// A descriptor in the wait set.
#[derive(Debug, Clone, Copy)]
pub struct Watch<'fd> {
    fd: BorrowedFd<'fd>,
    interest: Interest,
}

impl<'fd> Watch<'fd> {
    pub const fn readable(fd: BorrowedFd<'fd>) -> Self {
        Self {
            fd,
            interest: Interest::Readable,
        }
    }

    pub const fn writable(fd: BorrowedFd<'fd>) -> Self {
        Self {
            fd,
            interest: Interest::Writable,
        }
    }

    const fn events(&self) -> PollFlags {
        match self.interest {
            Interest::Readable => PollFlags::POLLIN,
            Interest::Writable => PollFlags::POLLOUT,
        }
    }

    fn poll_fd(&self) -> PollFd<'fd> {
        PollFd::new(self.fd, self.events())
    }
}

/// Indices (into the watch slice) of descriptors that became ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadySet(u64);

impl ReadySet {
    pub const fn contains(self, index: usize) -> bool {
        index < 64 && self.0 & (1 << index) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    const fn insert(&mut self, index: usize) {
        self.0 |= 1 << index;
    }
}

/// Result of [`CancelToken::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// At least one watched descriptor is ready.
    Ready(ReadySet),
    /// The token was posted and no watched descriptor is ready.
    Cancelled,
}

/// Process-lifetime cancellation flag with an OS-level wakeup.
#[derive(Debug)]
pub struct CancelToken {
    cancelled: AtomicBool,
    wake_read: OwnedFd,
    wake_write: OwnedFd,
}

impl CancelToken {
    pub fn new() -> Result<Self> {
        let (wake_read, wake_write) =
            unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).map_err(Error::Pipe)?;
        Ok(Self {
            cancelled: AtomicBool::new(false),
            wake_read,
            wake_write,
        })
    }

    /// Set the flag and wake any waiter. Idempotent.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!("Cancellation requested");
            self.post();
        }
    }

    /// Signal-handler entry point: no allocation, no locks, errno preserved.
    pub(crate) fn post(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let saved = Errno::last_raw();
        // EAGAIN means the pipe already holds unread wakeups.
        let _ = unistd::write(&self.wake_write, &[1u8]);
        Errno::set_raw(saved);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Block until a watched descriptor is ready or the token is posted.
    ///
    /// Hang-up and error conditions count as ready so the caller gets to see
    /// them on its next read or write. When descriptors are ready the token
    /// is not reported, letting the caller drain them first.
    pub fn wait(&self, watches: &[Watch<'_>]) -> Result<WaitOutcome> {
        debug_assert!(watches.len() < 64, "wait set too large");
        let mut fds: Vec<PollFd<'_>> = watches.iter().map(Watch::poll_fd).collect();
        fds.push(PollFd::new(self.wake_read.as_fd(), PollFlags::POLLIN));
        let ready_mask = PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL;

        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Poll(e)),
            }

            let mut ready = ReadySet::default();
            for (index, (watch, pfd)) in watches.iter().zip(&fds).enumerate() {
                let wanted = watch.events() | ready_mask;
                if pfd.revents().is_some_and(|r| r.intersects(wanted)) {
                    ready.insert(index);
                }
            }
            if !ready.is_empty() {
                return Ok(WaitOutcome::Ready(ready));
            }
            let woken = fds
                .last()
                .and_then(PollFd::revents)
                .is_some_and(|r| !r.is_empty());
            if woken {
                return Ok(WaitOutcome::Cancelled);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::handle::Pipe;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn token_posted_before_wait_returns_immediately() {
        let token = CancelToken::new().unwrap();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.wait(&[]).unwrap(), WaitOutcome::Cancelled);
        // Sticky: a second wait still observes it.
        assert_eq!(token.wait(&[]).unwrap(), WaitOutcome::Cancelled);
    }

    #[test]
    fn cancel_is_idempotent() {
        let token = CancelToken::new().unwrap();
        token.cancel();
        token.cancel();
        token.post();
        assert_eq!(token.wait(&[]).unwrap(), WaitOutcome::Cancelled);
    }

    #[test]
    fn cancel_from_other_thread_wakes_idle_wait() {
        let token = Arc::new(CancelToken::new().unwrap());
        let idle = Pipe::new("idle").unwrap();
        let remote = Arc::clone(&token);
        let started = Instant::now();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        let outcome = token
            .wait(&[Watch::readable(idle.read_fd().unwrap())])
            .unwrap();
        canceller.join().unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn ready_descriptor_reports_its_index() {
        let token = CancelToken::new().unwrap();
        let quiet = Pipe::new("quiet").unwrap();
        let busy = Pipe::new("busy").unwrap();
        busy.write(b"x").unwrap();
        let outcome = token
            .wait(&[
                Watch::readable(quiet.read_fd().unwrap()),
                Watch::readable(busy.read_fd().unwrap()),
            ])
            .unwrap();
        let WaitOutcome::Ready(ready) = outcome else {
            panic!("expected ready, got {outcome:?}");
        };
        assert!(!ready.contains(0));
        assert!(ready.contains(1));
    }

    #[test]
    fn ready_descriptors_take_precedence_over_token() {
        let token = CancelToken::new().unwrap();
        let pipe = Pipe::new("data").unwrap();
        pipe.write(b"pending").unwrap();
        token.cancel();
        let outcome = token
            .wait(&[Watch::readable(pipe.read_fd().unwrap())])
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Ready(r) if r.contains(0)));
    }

    #[test]
    fn writable_pipe_is_ready() {
        let token = CancelToken::new().unwrap();
        let pipe = Pipe::new("out").unwrap();
        let outcome = token
            .wait(&[Watch::writable(pipe.write_fd().unwrap())])
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Ready(r) if r.contains(0)));
    }

    #[test]
    fn hangup_counts_as_readable() {
        let token = CancelToken::new().unwrap();
        let mut pipe = Pipe::new("hup").unwrap();
        pipe.close_write();
        let outcome = token
            .wait(&[Watch::readable(pipe.read_fd().unwrap())])
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Ready(r) if r.contains(0)));
    }
}
