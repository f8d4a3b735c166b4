//! Error handling for dialup.
use thiserror::Error;

use crate::process::Role;

/// Defines all possible errors raised by the dial-up supervisor.
#[derive(Debug, Error)]
pub enum DialupError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[source] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A configuration value was syntactically valid YAML but semantically wrong.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Error spawning a dial-up control program.
    #[error("Failed to start {role} tool '{command}': {source}")]
    SpawnFailed {
        /// Which slot the process was meant to occupy.
        role: Role,
        /// The program that could not be launched.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error writing the credentials store.
    #[error("Failed to save credentials: {0}")]
    CredentialsSaveError(#[from] CredentialsError),

    /// Error from the readiness reactor.
    #[error("Readiness wait failed: {0}")]
    Poll(#[from] nix::errno::Errno),

    /// Error from the control channel.
    #[error(transparent)]
    Control(#[from] crate::ipc::ControlError),

    /// Generic I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Error type for credential store operations.
#[derive(Debug, Error)]
pub enum CredentialsError {
    /// Error reading or writing the credentials file.
    #[error("Credentials file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Error encoding or decoding the credentials file.
    #[error("Credentials file is malformed: {0}")]
    Format(#[from] serde_yaml::Error),
}
