//! Runtime paths derived from the user's home directory.
use std::{env, path::PathBuf};

use crate::constants::{
    CONTROL_SOCKET_NAME, CREDENTIALS_FILE_NAME, DIAL_LOG_FILE_NAME,
    SUPERVISOR_PID_FILE_NAME,
};

fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Directory holding runtime artifacts (socket, PID file, logs).
pub fn state_dir() -> PathBuf {
    home_dir().join(".local/share/dialup")
}

/// Directory holding the dial log.
pub fn log_dir() -> PathBuf {
    state_dir().join("logs")
}

/// Directory holding user configuration and credentials.
pub fn config_dir() -> PathBuf {
    home_dir().join(".config/dialup")
}

/// Fixed location of the persisted credentials.
pub fn credentials_path() -> PathBuf {
    config_dir().join(CREDENTIALS_FILE_NAME)
}

/// Default location of the append-only dial log.
pub fn dial_log_path() -> PathBuf {
    log_dir().join(DIAL_LOG_FILE_NAME)
}

/// Location of the control socket.
pub fn socket_path() -> PathBuf {
    state_dir().join(CONTROL_SOCKET_NAME)
}

/// Location of the supervisor PID file.
pub fn supervisor_pid_path() -> PathBuf {
    state_dir().join(SUPERVISOR_PID_FILE_NAME)
}
