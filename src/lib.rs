//! dialup is a headless supervisor for PPP dial-up links. It polls the network
//! interface list to decide whether a link is up, runs the external connect and
//! disconnect tools, and relays their output into an append-only log without
//! ever blocking on a child process.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Shared constants.
pub mod constants;

/// Persisted dial-up credentials.
pub mod credentials;

/// Error handling.
pub mod error;

/// Interface enumeration and link classification.
pub mod interfaces;

/// IPC helpers for communicating with the resident supervisor.
pub mod ipc;

/// Log sinks for relayed tool output.
pub mod logs;

/// Child process lifecycle.
pub mod process;

/// Readiness multiplexing over child output pipes.
pub mod reactor;

/// Non-blocking output relay.
pub mod relay;

/// Runtime directory layout.
pub mod runtime;

/// Connection supervisor.
pub mod supervisor;

#[doc(hidden)]
pub mod test_utils;
