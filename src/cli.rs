//! Command-line interface for dialup.
use std::str::FromStr;

use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Parses the `--legacy` flag value.
fn parse_switch(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(format!("expected true or false, got '{other}'")),
    }
}

/// Command-line interface for dialup.
#[derive(Parser)]
#[command(name = "dialup", version, author)]
#[command(about = "A headless supervisor for PPP dial-up connections", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Credential fields accepted on the command line. Unset fields keep their
/// stored value.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialArgs {
    /// Account name passed to the connect tool.
    #[arg(long)]
    pub login: Option<String>,

    /// Account password passed to the connect tool.
    #[arg(long)]
    pub password: Option<String>,

    /// Use the legacy provider endpoint (true/false).
    #[arg(long, value_name = "BOOL", value_parser = parse_switch)]
    pub legacy: Option<bool>,
}

impl CredentialArgs {
    pub fn is_empty(&self) -> bool {
        self.login.is_none() && self.password.is_none() && self.legacy.is_none()
    }
}

/// Available commands for dialup.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the supervisor in the foreground until interrupted.
    Run {
        /// Path to the configuration file (defaults to `dialup.yaml` or
        /// `~/.config/dialup/dialup.yaml`).
        #[arg(short, long)]
        config: Option<String>,

        /// Dial immediately after starting with the stored credentials.
        #[arg(long)]
        connect: bool,
    },

    /// Ask the running supervisor to dial.
    Connect {
        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// Ask the running supervisor to hang up.
    Disconnect,

    /// Show connection status.
    Status {
        /// Path to the configuration file used when no supervisor is running.
        #[arg(short, long)]
        config: Option<String>,

        /// Emit machine-readable JSON output.
        #[arg(long)]
        json: bool,
    },

    /// List network interfaces and whether each counts as a dial-up link.
    Interfaces {
        /// Path to the configuration file providing the interface pattern.
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Update stored credentials.
    SetCredentials {
        /// Path to the configuration file used when no supervisor is running.
        #[arg(short, long)]
        config: Option<String>,

        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// Stop the running supervisor.
    Shutdown,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
