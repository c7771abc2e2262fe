//! Configuration resolution for rktbatch.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Config file (`--config`, or ~/.config/rktbatch/config.toml)
//! 3. Environment variables (`DD_<NAME>`, `RKTBATCH_*`)
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::relay::{DEFAULT_BUFFER_SIZE, MAX_FEED};

/// Complete rktbatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    /// Listen for operator console commands.
    pub console_commands: bool,
    /// Bytes moved per relay transfer.
    pub buffer_size: usize,
    pub dd: DdConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            console_commands: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            dd: DdConfig::default(),
        }
    }
}

/// Paths allocated to each DD name. Unset means not allocated.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DdConfig {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub sysout: Option<PathBuf>,
    pub stdenv: Option<PathBuf>,
}

impl DdConfig {
    /// Allocation for `dd` (case-insensitive DD name).
    pub fn get(&self, dd: &str) -> Option<&Path> {
        match dd.to_ascii_uppercase().as_str() {
            "STDIN" => self.stdin.as_deref(),
            "STDOUT" => self.stdout.as_deref(),
            "STDERR" => self.stderr.as_deref(),
            "SYSOUT" => self.sysout.as_deref(),
            "STDENV" => self.stdenv.as_deref(),
            _ => None,
        }
    }

    fn slot_mut(&mut self, dd: &str) -> Option<&mut Option<PathBuf>> {
        match dd {
            "STDIN" => Some(&mut self.stdin),
            "STDOUT" => Some(&mut self.stdout),
            "STDERR" => Some(&mut self.stderr),
            "SYSOUT" => Some(&mut self.sysout),
            "STDENV" => Some(&mut self.stdenv),
            _ => None,
        }
    }
}

/// DD names the supervisor knows about.
pub const DD_NAMES: &[&str] = &["STDIN", "STDOUT", "STDERR", "SYSOUT", "STDENV"];

/// Load configuration with hierarchical resolution.
///
/// An explicit `path` must exist; the global file is optional.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => match global_config_path() {
            Some(global) if global.exists() => load_config_file(&global)?,
            _ => Config::default(),
        },
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("rktbatch").join("config.toml"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    toml::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply `DD_<NAME>`, `RKTBATCH_LOG_LEVEL` and `RKTBATCH_CONSOLE_COMMANDS`.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    for dd in DD_NAMES {
        if let Some(path) = lookup(&format!("DD_{dd}")).filter(|p| !p.is_empty()) {
            if let Some(slot) = config.dd.slot_mut(dd) {
                *slot = Some(PathBuf::from(path));
            }
        }
    }
    if let Some(level) = lookup("RKTBATCH_LOG_LEVEL") {
        config.log_level = level;
    }
    if let Some(val) = lookup("RKTBATCH_CONSOLE_COMMANDS") {
        match val.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => config.console_commands = true,
            "0" | "false" | "no" | "off" => config.console_commands = false,
            _ => {}
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer_size must be greater than 0".into()));
        }
        if self.buffer_size > MAX_FEED {
            return Err(Error::Config(format!(
                "buffer_size {} exceeds the atomic pipe write size {MAX_FEED}",
                self.buffer_size
            )));
        }
        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(Error::Config(format!(
                "invalid log_level {:?} (expected trace, debug, info, warn or error)",
                self.log_level
            )));
        }
        Ok(())
    }
}
