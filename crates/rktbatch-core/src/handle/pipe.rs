//! Anonymous pipe with independently closable ends.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd;

use crate::error::{Error, Result};

/// One side of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    Read,
    Write,
}

/// An OS byte pipe. Each end goes OPEN → CLOSED exactly once.
#[derive(Debug)]
pub struct Pipe {
    label: &'static str,
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

impl Pipe {
    /// Create a close-on-exec pipe. `label` names it in errors and logs.
    pub fn new(label: &'static str) -> Result<Self> {
        let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(Error::Pipe)?;
        Ok(Self {
            label,
            read: Some(read),
            write: Some(write),
        })
    }

    pub const fn label(&self) -> &'static str {
        self.label
    }

    const fn slot(&self, end: End) -> &Option<OwnedFd> {
        match end {
            End::Read => &self.read,
            End::Write => &self.write,
        }
    }

    /// Borrow the descriptor of `end`, if it is still open.
    pub fn fd(&self, end: End) -> Option<BorrowedFd<'_>> {
        self.slot(end).as_ref().map(AsFd::as_fd)
    }

    pub fn read_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd(End::Read)
    }

    pub fn write_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd(End::Write)
    }

    pub const fn is_open(&self, end: End) -> bool {
        self.slot(end).is_some()
    }

    pub const fn is_read_open(&self) -> bool {
        self.is_open(End::Read)
    }

    pub const fn is_write_open(&self) -> bool {
        self.is_open(End::Write)
    }

    /// Close `end`. Closing an already closed end does nothing.
    pub fn close(&mut self, end: End) {
        let slot = match end {
            End::Read => &mut self.read,
            End::Write => &mut self.write,
        };
        drop(slot.take());
    }

    pub fn close_read(&mut self) {
        self.close(End::Read);
    }

    pub fn close_write(&mut self) {
        self.close(End::Write);
    }

    /// Duplicate `end` into a new owned descriptor, e.g. to hand to a child.
    pub fn dup(&self, end: End) -> Result<OwnedFd> {
        let fd = self
            .fd(end)
            .ok_or_else(|| Error::Closed(format!("{} {end:?} end", self.label)))?;
        Ok(fd.try_clone_to_owned()?)
    }

    /// Read from the read end, retrying on `EINTR`. Returns 0 at end of file.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self
            .read_fd()
            .ok_or_else(|| Error::Closed(format!("{} read end", self.label)))?;
        loop {
            match unistd::read(fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => {}
                Err(e) => {
                    return Err(Error::Read {
                        name: self.label.to_string(),
                        source: io::Error::from(e),
                    });
                }
            }
        }
    }

    /// Write all of `buf` to the write end in one call, retrying on `EINTR`.
    ///
    /// A write that transfers fewer bytes than requested is an error.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let fd = self
            .write_fd()
            .ok_or_else(|| Error::Closed(format!("{} write end", self.label)))?;
        let written = loop {
            match unistd::write(fd, buf) {
                Ok(n) => break n,
                Err(Errno::EINTR) => {}
                Err(e) => {
                    return Err(Error::Write {
                        name: self.label.to_string(),
                        source: io::Error::from(e),
                    });
                }
            }
        };
        if written != buf.len() {
            return Err(Error::ShortWrite {
                target: self.label.to_string(),
                expected: buf.len(),
                written,
            });
        }
        Ok(written)
    }
}
