//! Error types for the `rktbatch` core library.

use thiserror::Error;

/// Result type alias using the core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for supervisor operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A dataset or file could not be opened.
    #[error("Error opening {name}: {source}")]
    Open {
        name: String,
        source: std::io::Error,
    },

    /// A required DD has no allocation.
    #[error("DD {0} is not allocated")]
    NotAllocated(String),

    /// Read or write on a handle whose end is already closed.
    #[error("{0} is closed")]
    Closed(String),

    #[error("Error creating pipe: {0}")]
    Pipe(#[source] nix::Error),

    #[error("Error reading from {name}: {source}")]
    Read {
        name: String,
        source: std::io::Error,
    },

    #[error("Error writing to {name}: {source}")]
    Write {
        name: String,
        source: std::io::Error,
    },

    /// Fewer bytes were accepted than requested.
    #[error("Short write to {target}: {written} of {expected} bytes")]
    ShortWrite {
        target: String,
        expected: usize,
        written: usize,
    },

    #[error("poll() failed: {0}")]
    Poll(#[source] nix::Error),

    #[error("sigaction() failed for {signal}: {source}")]
    Signal {
        signal: nix::sys::signal::Signal,
        source: nix::Error,
    },

    /// Another cancellation token already owns the SIGCHLD wakeup.
    #[error("SIGCHLD wakeup is already registered")]
    AlreadyRegistered,

    #[error("Failed to spawn program {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("kill() failed for process group {pgid}: {source}")]
    Kill { pgid: i32, source: nix::Error },

    #[error("waitpid() failed for {program}: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },

    /// Password database lookup for the invoking user failed.
    #[error("User lookup failed: {0}")]
    User(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The underlying I/O error kind, when the failure came from a read or write.
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            Self::Open { source, .. }
            | Self::Read { source, .. }
            | Self::Write { source, .. }
            | Self::Io(source) => Some(source.kind()),
            _ => None,
        }
    }
}
