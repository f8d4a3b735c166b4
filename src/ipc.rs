//! Control channel between CLI invocations and the resident supervisor.
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, BufRead, BufReader, Read, Write},
    os::{
        fd::{AsFd, BorrowedFd},
        unix::net::UnixStream,
    },
    path::PathBuf,
    time::Instant,
};
use thiserror::Error;

use crate::{
    constants::{CONTROL_READ_CHUNK_SIZE, MAX_CONTROL_REQUEST_BYTES},
    runtime,
    supervisor::{Affordances, StatusReport},
};

/// Creates the runtime directory if needed and returns the socket path.
pub fn socket_path() -> Result<PathBuf, ControlError> {
    fs::create_dir_all(runtime::state_dir())?;
    Ok(runtime::socket_path())
}

/// Message sent from CLI invocations to the resident supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    Connect,
    Disconnect,
    Status,
    SetCredentials {
        login: Option<String>,
        password: Option<String>,
        legacy_endpoint: Option<bool>,
    },
    Shutdown,
}

/// Response sent by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlResponse {
    Ok,
    Message(String),
    Status(StatusReport),
    Error(String),
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to serialise control message: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("supervisor reported error: {0}")]
    Server(String),
    #[error("control socket not available")]
    NotAvailable,
}

/// Sends a command to the supervisor and waits for a response.
pub fn send_command(command: &ControlCommand) -> Result<ControlResponse, ControlError> {
    let path = runtime::socket_path();
    if !path.exists() {
        return Err(ControlError::NotAvailable);
    }

    let mut stream = match UnixStream::connect(&path) {
        Ok(stream) => stream,
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
            ) =>
        {
            return Err(ControlError::NotAvailable);
        }
        Err(err) => return Err(err.into()),
    };
    write_message(&mut stream, command)?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    if response_line.trim().is_empty() {
        return Err(ControlError::NotAvailable);
    }

    let response: ControlResponse = serde_json::from_str(response_line.trim())?;
    if let ControlResponse::Error(message) = &response {
        return Err(ControlError::Server(message.clone()));
    }

    Ok(response)
}

/// Outcome of reading from a [`ControlConnection`].
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// No complete request line yet.
    Pending,
    /// A full request arrived.
    Command(ControlCommand),
    /// The client hung up before sending a full request.
    Closed,
}

/// Supervisor side of one accepted control connection.
///
/// The stream is non-blocking. Each read takes what is available and the
/// response is written only as far as the socket accepts it, so a slow or
/// silent client never holds up the event loop.
#[derive(Debug)]
pub struct ControlConnection {
    stream: UnixStream,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    written: usize,
    opened: Instant,
}

impl ControlConnection {
    pub fn new(stream: UnixStream) -> Result<Self, ControlError> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            inbound: Vec::new(),
            outbound: Vec::new(),
            written: 0,
            opened: Instant::now(),
        })
    }

    pub fn opened(&self) -> Instant {
        self.opened
    }

    /// Whether a queued response still has bytes left to write.
    pub fn wants_write(&self) -> bool {
        self.written < self.outbound.len()
    }

    /// Performs one read and returns the request once its line is complete.
    pub fn read_available(&mut self) -> Result<ConnectionEvent, ControlError> {
        let mut chunk = [0u8; CONTROL_READ_CHUNK_SIZE];
        let read = match self.stream.read(&mut chunk) {
            Ok(0) => return Ok(ConnectionEvent::Closed),
            Ok(read) => read,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(ConnectionEvent::Pending);
            }
            Err(err) => return Err(err.into()),
        };
        self.inbound.extend_from_slice(&chunk[..read]);

        let Some(end) = self.inbound.iter().position(|byte| *byte == b'\n') else {
            if self.inbound.len() > MAX_CONTROL_REQUEST_BYTES {
                return Err(ControlError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "control request too large",
                )));
            }
            return Ok(ConnectionEvent::Pending);
        };

        let line = String::from_utf8_lossy(&self.inbound[..end]);
        if line.trim().is_empty() {
            return Err(ControlError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "empty control command",
            )));
        }
        Ok(ConnectionEvent::Command(serde_json::from_str(line.trim())?))
    }

    /// Replaces any queued output with `response`.
    pub fn queue_response(&mut self, response: &ControlResponse) -> Result<(), ControlError> {
        let mut payload = serde_json::to_vec(response)?;
        payload.push(b'\n');
        self.outbound = payload;
        self.written = 0;
        Ok(())
    }

    /// Writes as much of the queued response as the socket takes. Returns
    /// whether it has been written completely.
    pub fn flush(&mut self) -> Result<bool, ControlError> {
        while self.wants_write() {
            match self.stream.write(&self.outbound[self.written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(written) => self.written += written,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(true)
    }
}

impl AsFd for ControlConnection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

fn write_message<T: Serialize>(stream: &mut UnixStream, message: &T) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(message)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

/// Persists the supervisor PID for later CLI detection.
pub fn write_supervisor_pid(pid: libc::pid_t) -> Result<(), ControlError> {
    fs::create_dir_all(runtime::state_dir())?;
    fs::write(runtime::supervisor_pid_path(), pid.to_string())?;
    Ok(())
}

/// Reads the supervisor PID if present.
pub fn read_supervisor_pid() -> Result<Option<libc::pid_t>, ControlError> {
    let path = runtime::supervisor_pid_path();
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    contents
        .trim()
        .parse::<libc::pid_t>()
        .map(Some)
        .map_err(|e| ControlError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// Clears the supervisor PID and removes the socket file.
pub fn cleanup_runtime() -> Result<(), ControlError> {
    let socket = runtime::socket_path();
    if socket.exists() {
        let _ = fs::remove_file(socket);
    }

    let pid_path = runtime::supervisor_pid_path();
    if pid_path.exists() {
        let _ = fs::remove_file(pid_path);
    }

    Ok(())
}

/// Renders a status report the way the CLI prints it.
pub fn format_status(report: &StatusReport) -> String {
    let Affordances {
        connect_enabled,
        disconnect_enabled,
    } = report.affordances;
    let mut lines = vec![
        format!("Connection: {}", report.status.label()),
        format!("Login: {}", report.login),
        format!("Endpoint: {}", report.endpoint),
        format!(
            "Actions: connect {}, disconnect {}",
            if connect_enabled { "enabled" } else { "disabled" },
            if disconnect_enabled { "enabled" } else { "disabled" }
        ),
    ];
    if let Some(pid) = report.connect_pid {
        lines.push(format!("Connect tool PID: {pid}"));
    }
    if let Some(pid) = report.disconnect_pid {
        lines.push(format!("Disconnect tool PID: {pid}"));
    }
    lines.join("\n")
}
