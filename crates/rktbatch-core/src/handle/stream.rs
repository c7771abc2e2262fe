//! Buffered byte stream over a dataset, console or fallback sink.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::warn;

use crate::error::{Error, Result};

/// How a stream is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    /// Create or truncate.
    Write,
    Append,
}

enum Inner {
    Reader(BufReader<Box<dyn Read + Send>>),
    Writer(BufWriter<Box<dyn Write + Send>>),
}

/// A named, buffered byte stream. Released exactly once, on `close` or drop.
pub struct Stream {
    name: String,
    inner: Option<Inner>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Stream {
    /// Open `path` in `mode`. The error names `name` and the path.
    pub fn open(name: impl Into<String>, path: &Path, mode: Mode) -> Result<Self> {
        let name = name.into();
        let file = match mode {
            Mode::Read => File::open(path),
            Mode::Write => File::create(path),
            Mode::Append => OpenOptions::new().create(true).append(true).open(path),
        }
        .map_err(|source| Error::Open {
            name: format!("{name} ({})", path.display()),
            source,
        })?;
        Ok(match mode {
            Mode::Read => Self::from_reader(name, file),
            Mode::Write | Mode::Append => Self::from_writer(name, file),
        })
    }

    pub fn from_reader(name: impl Into<String>, reader: impl Read + Send + 'static) -> Self {
        Self {
            name: name.into(),
            inner: Some(Inner::Reader(BufReader::new(Box::new(reader)))),
        }
    }

    pub fn from_writer(name: impl Into<String>, writer: impl Write + Send + 'static) -> Self {
        Self {
            name: name.into(),
            inner: Some(Inner::Writer(BufWriter::new(Box::new(writer)))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Read up to `buf.len()` bytes, retrying on `EINTR`. Returns 0 at end of input.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(Inner::Reader(reader)) = self.inner.as_mut() else {
            return Err(self.not_open("reading"));
        };
        loop {
            match reader.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => {
                    return Err(Error::Read {
                        name: self.name.clone(),
                        source,
                    });
                }
            }
        }
    }

    /// Write all of `buf`. A sink that stops accepting bytes is a short write.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let Some(Inner::Writer(writer)) = self.inner.as_mut() else {
            return Err(self.not_open("writing"));
        };
        let mut written = 0;
        while written < buf.len() {
            match writer.write(&buf[written..]) {
                Ok(0) => {
                    return Err(Error::ShortWrite {
                        target: self.name.clone(),
                        expected: buf.len(),
                        written,
                    });
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => {
                    return Err(Error::Write {
                        name: self.name.clone(),
                        source,
                    });
                }
            }
        }
        Ok(written)
    }

    /// Flush buffered output. No-op for readers and closed streams.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(Inner::Writer(writer)) = self.inner.as_mut() {
            writer.flush().map_err(|source| Error::Write {
                name: self.name.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Flush and release the stream. Safe to call more than once.
    pub fn close(&mut self) {
        if let Err(e) = self.flush() {
            warn!(stream = %self.name, error = %e, "Flush on close failed");
        }
        self.inner = None;
    }

    fn not_open(&self, op: &str) -> Error {
        match self.inner {
            None => Error::Closed(self.name.clone()),
            Some(_) => Error::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} is not open for {op}", self.name),
            )),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn open_missing_file_names_the_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let err = Stream::open("STDIN", &path, Mode::Read).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("STDIN"), "{msg}");
        assert!(msg.contains("absent"), "{msg}");
    }

    #[test]
    fn written_bytes_land_in_file_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let mut stream = Stream::open("STDOUT", &path, Mode::Write).unwrap();
        assert_eq!(stream.write(b"abc").unwrap(), 3);
        stream.close();
        stream.close();
        assert!(!stream.is_open());
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }

    #[test]
    fn append_mode_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, b"one\n").unwrap();
        let mut stream = Stream::open("SYSOUT", &path, Mode::Append).unwrap();
        stream.write(b"two\n").unwrap();
        drop(stream);
        assert_eq!(std::fs::read(&path).unwrap(), b"one\ntwo\n");
    }

    #[test]
    fn reader_yields_all_bytes_then_eof() {
        let mut stream = Stream::from_reader("STDIN", Cursor::new(b"xyz".to_vec()));
        let mut buf = [0u8; 2];
        assert_eq!(stream.read(&mut buf).unwrap(), 2);
        assert_eq!(stream.read(&mut buf).unwrap(), 1);
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn io_after_close_is_an_error() {
        let mut stream = Stream::from_reader("STDIN", Cursor::new(Vec::new()));
        stream.close();
        assert!(matches!(stream.read(&mut [0u8; 1]), Err(Error::Closed(_))));
    }

    #[test]
    fn writing_to_a_reader_is_rejected() {
        let mut stream = Stream::from_reader("STDIN", Cursor::new(Vec::new()));
        assert!(stream.write(b"x").is_err());
    }

    struct Full;

    impl Write for Full {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Ok(0)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn sink_that_accepts_nothing_is_a_short_write() {
        let mut stream = Stream::from_writer("STDOUT", Full);
        // Larger than the BufWriter capacity so the write reaches the sink.
        let big = vec![0u8; 64 * 1024];
        let err = stream.write(&big).unwrap_err();
        assert!(matches!(err, Error::ShortWrite { ref target, .. } if target == "STDOUT"));
    }
}
