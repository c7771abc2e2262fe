//! Environment block for the spawned program and login user lookup.
//!
//! The block starts from fixed z/OS UNIX defaults, adds `HOME` and `PWD` for
//! the invoking user, then appends `KEY=value` lines from the STDENV dataset.
//! Entries keep their order; duplicates are passed through as given.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use nix::unistd::{Uid, User};
use tracing::debug;

use crate::error::{Error, Result};

/// Entries every job starts with.
pub const DEFAULT_ENV: &[&str] = &[
    "LIBPATH=/lib:/usr/lib",
    "PATH=/bin:/usr/bin",
    "_BPXK_AUTOCVT=ON",
    "_BPXK_JOBLOG=STDERR",
    "_BPX_SPAWN_SCRIPT=YES",
    "_EDC_ADD_ERRNO2=1",
];

const SHAREAS_KEY: &str = "_BPX_SHAREAS=";
const SHAREAS_DEFAULT: &str = "_BPX_SHAREAS=MUST";

/// Password database entry of the user running the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginUser {
    pub name: String,
    pub home: PathBuf,
    pub shell: PathBuf,
}

/// Look up the invoking user by real uid.
pub fn login_user() -> Result<LoginUser> {
    let uid = Uid::current();
    let user = User::from_uid(uid)
        .map_err(|e| Error::User(format!("getpwuid({uid}) failed: {e}")))?
        .ok_or_else(|| Error::User(format!("no password entry for uid {uid}")))?;
    Ok(LoginUser {
        name: user.name,
        home: user.dir,
        shell: user.shell,
    })
}

/// Ordered `KEY=value` entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvBlock {
    entries: Vec<String>,
    share_address_space: bool,
}

impl EnvBlock {
    /// Defaults plus `HOME` and `PWD` set to `home`.
    pub fn with_defaults(home: &Path) -> Self {
        let mut entries: Vec<String> = DEFAULT_ENV.iter().map(|e| (*e).to_string()).collect();
        entries.push(format!("HOME={}", home.display()));
        entries.push(format!("PWD={}", home.display()));
        Self {
            entries,
            share_address_space: true,
        }
    }

    pub fn push(&mut self, entry: impl Into<String>) {
        self.entries.push(entry.into());
    }

    /// Append STDENV lines. Leading blanks are trimmed; blank lines and
    /// `#` comments are skipped. An explicit `_BPX_SHAREAS` disables the
    /// shared address space default.
    pub fn extend_from_stdenv(&mut self, reader: impl BufRead) -> Result<()> {
        for line in reader.lines() {
            let line = line?;
            let line = line.trim_start();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with(SHAREAS_KEY) {
                self.share_address_space = false;
            }
            debug!(entry = line, "STDENV entry");
            self.entries.push(line.to_string());
        }
        Ok(())
    }

    /// Final entry list, with `_BPX_SHAREAS=MUST` appended unless overridden.
    pub fn finish(mut self) -> Vec<String> {
        if self.share_address_space {
            self.entries.push(SHAREAS_DEFAULT.to_string());
        }
        self.entries
    }
}

/// Split `KEY=value` at the first `=`. Entries without one have no value.
pub fn split_entry(entry: &str) -> Option<(&str, &str)> {
    entry.split_once('=').filter(|(key, _)| !key.is_empty())
}
