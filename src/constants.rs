//! Constants and default values for the dial-up supervisor.
//!
//! This module centralizes the magic numbers and strings used throughout the
//! supervisor so the defaults live in one place.

use std::time::Duration;

// ============================================================================
// File System Constants
// ============================================================================

/// Name of the supervisor configuration file searched in the working directory.
pub const CONFIG_FILE_NAME: &str = "dialup.yaml";

/// Name of the persisted credentials file inside the config directory.
pub const CREDENTIALS_FILE_NAME: &str = "credentials.yaml";

/// Name of the file the resident supervisor records its PID in.
pub const SUPERVISOR_PID_FILE_NAME: &str = "dialup.pid";

/// Name of the unix socket used for control commands.
pub const CONTROL_SOCKET_NAME: &str = "control.sock";

/// Name of the append-only dial log.
pub const DIAL_LOG_FILE_NAME: &str = "dial.log";

// ============================================================================
// Polling and I/O
// ============================================================================

/// Interval between interface polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on a single read from a child output pipe.
pub const READ_CHUNK_SIZE: usize = 8192;

/// Maximum number of chunks pulled from the sibling stream once one stream ends.
pub const SIBLING_DRAIN_CHUNKS: usize = 16;

/// Accepted control connections that have not completed a request within this
/// window are dropped.
pub const CONTROL_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum connections accepted per listener readiness.
pub const CONTROL_ACCEPT_BATCH: usize = 16;

/// Upper bound on a single read from a control connection.
pub const CONTROL_READ_CHUNK_SIZE: usize = 4096;

/// Requests longer than this are rejected.
pub const MAX_CONTROL_REQUEST_BYTES: usize = 64 * 1024;

// ============================================================================
// Interface Classification
// ============================================================================

/// Interfaces whose name starts with this pattern count as a live PPP link.
pub const DEFAULT_INTERFACE_PATTERN: &str = "^ppp[0-9]*";

// ============================================================================
// Dial-up Tools
// ============================================================================

/// Default connect program.
pub const DEFAULT_CONNECT_COMMAND: &str = "pppd";

/// Default arguments for the connect program.
pub const DEFAULT_CONNECT_ARGS: &[&str] = &[
    "call",
    "{endpoint}",
    "user",
    "{login}",
    "password",
    "{password}",
    "nodetach",
    "debug",
];

/// Default disconnect program.
pub const DEFAULT_DISCONNECT_COMMAND: &str = "poff";

/// Default arguments for the disconnect program.
pub const DEFAULT_DISCONNECT_ARGS: &[&str] = &["{endpoint}"];

/// Provider name used when the legacy endpoint is selected.
pub const DEFAULT_LEGACY_ENDPOINT: &str = "dsl-provider-legacy";

/// Provider name used for the standard endpoint.
pub const DEFAULT_STANDARD_ENDPOINT: &str = "dsl-provider";

/// Argument placeholders substituted per argument.
pub const LOGIN_PLACEHOLDER: &str = "{login}";
pub const PASSWORD_PLACEHOLDER: &str = "{password}";
pub const ENDPOINT_PLACEHOLDER: &str = "{endpoint}";

// ============================================================================
// Log Sink Markers
// ============================================================================

/// Marker appended before the connect tool's output.
pub const CONNECTING_MARKER: &str = "Connecting...";

/// Marker appended before the disconnect tool's output.
pub const DISCONNECTING_MARKER: &str = "Disconnecting...";

/// Timestamp layout for log-sink markers.
pub const MARKER_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
