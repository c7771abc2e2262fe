//! Command line arguments.

use std::path::PathBuf;

use clap::Parser;
use rktbatch_core::Config;

#[derive(Parser, Debug)]
#[command(name = "rktbatch")]
#[command(version, about = "rktbatch - run a program as a batch job step")]
pub struct Args {
    /// Do not listen for operator console commands.
    #[arg(long)]
    pub disable_console_commands: bool,

    /// Log level (overrides the config file and `RKTBATCH_LOG_LEVEL`).
    #[arg(long, value_parser = ["trace", "debug", "info", "warn", "error"])]
    pub log_level: Option<String>,

    /// Output logs as JSON.
    #[arg(long, env = "RKTBATCH_LOG_JSON")]
    pub log_json: bool,

    /// Config file path (default: ~/.config/rktbatch/config.toml).
    #[arg(long, env = "RKTBATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Program and arguments. Runs the login shell when omitted.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub program: Vec<String>,
}

impl Args {
    /// Apply command line overrides on top of the loaded config.
    pub fn apply(&self, mut config: Config) -> Config {
        if self.disable_console_commands {
            config.console_commands = false;
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
        config
    }

    /// Log level to use before a config is available.
    pub fn early_log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn program_arguments_keep_their_flags() {
        let args =
            Args::try_parse_from(["rktbatch", "--log-level", "debug", "ls", "-l", "--all"]).unwrap();
        assert_eq!(args.program, ["ls", "-l", "--all"]);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(!args.disable_console_commands);
    }

    #[test]
    fn no_program_means_login_shell() {
        let args = Args::try_parse_from(["rktbatch"]).unwrap();
        assert!(args.program.is_empty());
        assert_eq!(args.early_log_level(), "info");
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        assert!(Args::try_parse_from(["rktbatch", "--log-level", "loud"]).is_err());
    }

    #[test]
    fn cli_overrides_config() {
        let args = Args::try_parse_from([
            "rktbatch",
            "--disable-console-commands",
            "--log-level",
            "warn",
            "true",
        ])
        .unwrap();
        let config = args.apply(Config::default());
        assert!(!config.console_commands);
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.buffer_size, Config::default().buffer_size);
    }
}
