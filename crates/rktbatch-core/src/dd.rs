//! DD name resolution and the job's dataset set.
//!
//! STDIN is required. STDOUT and STDERR are optional and fall back to SYSOUT.
//! SYSOUT is allocated to the supervisor's own stdout when it has no
//! allocation of its own.

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::DdConfig;
use crate::env::EnvBlock;
use crate::error::{Error, Result};
use crate::handle::{Mode, Stream};
use crate::relay::{Channel, Sinks};

/// Maps DD names to allocated paths.
#[derive(Debug, Clone, Default)]
pub struct DdTable {
    allocations: DdConfig,
}

impl DdTable {
    pub const fn new(allocations: DdConfig) -> Self {
        Self { allocations }
    }

    pub fn path(&self, dd: &str) -> Option<&Path> {
        self.allocations.get(dd)
    }

    /// Open `dd`. An unallocated DD is [`Error::NotAllocated`].
    pub fn open(&self, dd: &str, mode: Mode) -> Result<Stream> {
        let path = self
            .path(dd)
            .ok_or_else(|| Error::NotAllocated(dd.to_string()))?;
        let stream = Stream::open(dd, path, mode)?;
        debug!(dd, path = %path.display(), ?mode, "Opened dataset");
        Ok(stream)
    }

    /// Open an optional DD. Failure is logged and treated as absent.
    pub fn try_open(&self, dd: &str, mode: Mode) -> Option<Stream> {
        match self.open(dd, mode) {
            Ok(stream) => Some(stream),
            Err(Error::NotAllocated(_)) => {
                debug!(dd, "DD not allocated");
                None
            }
            Err(e) => {
                warn!(dd, error = %e, "Optional dataset unavailable");
                None
            }
        }
    }

    /// Environment for the child: defaults for `home`, then any STDENV lines.
    ///
    /// A STDENV that cannot be opened is skipped; one that fails mid-read is
    /// an error.
    pub fn env_block(&self, home: &Path) -> Result<Vec<String>> {
        let mut env = EnvBlock::with_defaults(home);
        if let Some(path) = self.path("STDENV") {
            match File::open(path) {
                Ok(file) => {
                    env.extend_from_stdenv(BufReader::new(file))
                        .map_err(|e| match e {
                            Error::Io(source) => Error::Read {
                                name: format!("STDENV ({})", path.display()),
                                source,
                            },
                            other => other,
                        })?;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "STDENV not readable; skipping"),
            }
        }
        Ok(env.finish())
    }
}

/// Output streams for the child's stdout and stderr, with SYSOUT fallback.
#[derive(Debug)]
pub struct OutputSinks {
    stdout: Option<Stream>,
    stderr: Option<Stream>,
    sysout: Stream,
}

impl OutputSinks {
    pub const fn new(stdout: Option<Stream>, stderr: Option<Stream>, sysout: Stream) -> Self {
        Self {
            stdout,
            stderr,
            sysout,
        }
    }

    /// Name of the stream receiving `channel`.
    pub fn target(&self, channel: Channel) -> &str {
        let stream = match channel {
            Channel::Stdout => self.stdout.as_ref(),
            Channel::Stderr => self.stderr.as_ref(),
        };
        stream.unwrap_or(&self.sysout).name()
    }
}

impl Sinks for OutputSinks {
    fn sink(&mut self, channel: Channel) -> &mut Stream {
        let stream = match channel {
            Channel::Stdout => self.stdout.as_mut(),
            Channel::Stderr => self.stderr.as_mut(),
        };
        match stream {
            Some(stream) => stream,
            None => &mut self.sysout,
        }
    }

    fn flush(&mut self) -> Result<()> {
        let mut first = None;
        for stream in [self.stdout.as_mut(), self.stderr.as_mut(), Some(&mut self.sysout)]
            .into_iter()
            .flatten()
        {
            if let Err(e) = stream.flush() {
                warn!(stream = stream.name(), error = %e, "Flush failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// The datasets a job runs against.
#[derive(Debug)]
pub struct JobDatasets {
    pub input: Stream,
    pub outputs: OutputSinks,
}

impl JobDatasets {
    /// Open the job's datasets, allocating SYSOUT to this process's stdout
    /// when it has no allocation.
    pub fn open(table: &DdTable) -> Result<Self> {
        Self::open_with_fallback(table, io::stdout())
    }

    /// As [`JobDatasets::open`], with `fallback` standing in for an
    /// unallocated SYSOUT.
    pub fn open_with_fallback(
        table: &DdTable,
        fallback: impl Write + Send + 'static,
    ) -> Result<Self> {
        let sysout = match table.open("SYSOUT", Mode::Write) {
            Ok(stream) => stream,
            Err(e) => {
                if !matches!(e, Error::NotAllocated(_)) {
                    warn!(error = %e, "SYSOUT dataset unavailable");
                }
                info!("Allocating SYSOUT to standard output");
                Stream::from_writer("SYSOUT", fallback)
            }
        };
        let input = table.open("STDIN", Mode::Read)?;
        let stdout = table.try_open("STDOUT", Mode::Write);
        let stderr = table.try_open("STDERR", Mode::Write);
        let outputs = OutputSinks::new(stdout, stderr, sysout);
        debug!(
            stdout = outputs.target(Channel::Stdout),
            stderr = outputs.target(Channel::Stderr),
            "Output routing"
        );
        Ok(Self { input, outputs })
    }
}
