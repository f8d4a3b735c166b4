//! Lifecycle management for the dial-up control child processes.
//!
//! The [`ProcessManager`] keeps a table keyed by [`Role`]. Each slot holds at
//! most one [`ManagedProcess`]; starting a process in an occupied slot kills and
//! releases the previous occupant first.
use std::{
    collections::HashMap,
    fmt,
    io::{self, Read},
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd},
        unix::process::CommandExt,
    },
    process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio},
};

use nix::{
    errno::Errno,
    fcntl::{FcntlArg, OFlag, fcntl},
    sys::signal::{self, Signal},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, error, info, warn};

use crate::{error::DialupError, reactor::Reactor};

/// Slot a child process occupies.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    Connect,
    Disconnect,
}

/// Which output pipe of a child a token refers to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Stdout, StreamKind::Stderr];

    pub fn sibling(self) -> Self {
        match self {
            StreamKind::Stdout => StreamKind::Stderr,
            StreamKind::Stderr => StreamKind::Stdout,
        }
    }
}

/// Identifies one output stream of one spawned process.
///
/// The generation is unique per spawn, so a token for a replaced process never
/// matches its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamToken {
    pub role: Role,
    pub kind: StreamKind,
    pub generation: u64,
}

impl StreamToken {
    pub fn sibling(self) -> Self {
        Self {
            kind: self.kind.sibling(),
            ..self
        }
    }
}

impl fmt::Display for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}/{}", self.role, self.generation, self.kind)
    }
}

/// Program and arguments to launch, with the secret argument masked in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    secret: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            secret: None,
        }
    }

    /// Marks a value that must never appear in log output.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        self.secret = (!secret.is_empty()).then_some(secret);
        self
    }

    fn redacted_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| match &self.secret {
                Some(secret) if arg.contains(secret.as_str()) => {
                    arg.replace(secret.as_str(), "******")
                }
                _ => arg.clone(),
            })
            .collect()
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.redacted_args())
            .finish()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in self.redacted_args() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Snapshot describing a freshly started process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub role: Role,
    pub generation: u64,
    pub pid: u32,
}

/// One external child process with its captured output pipes.
#[derive(Debug)]
pub struct ManagedProcess {
    role: Role,
    generation: u64,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    live: bool,
    exit_status: Option<ExitStatus>,
}

impl ManagedProcess {
    /// Launches `spec` in its own process group with both output pipes captured.
    fn spawn(
        role: Role,
        generation: u64,
        spec: &CommandSpec,
    ) -> Result<Self, DialupError> {
        debug!("Launching {role} tool: `{spec}`");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        unsafe {
            cmd.pre_exec(|| {
                // Own process group so the whole tree can be signalled at once.
                if libc::setpgid(0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }

                #[cfg(target_os = "linux")]
                {
                    use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                    if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|source| {
            error!("Failed to start {role} tool '{}': {source}", spec.program);
            DialupError::SpawnFailed {
                role,
                command: spec.program.clone(),
                source,
            }
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        if let Some(out) = &stdout {
            set_nonblocking(out, role, StreamKind::Stdout);
        }
        if let Some(err) = &stderr {
            set_nonblocking(err, role, StreamKind::Stderr);
        }

        info!("Started {role} tool with PID {}", child.id());

        Ok(Self {
            role,
            generation,
            child,
            stdout,
            stderr,
            live: true,
            exit_status: None,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Whether the process still has output streams registered for draining.
    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            role: self.role,
            generation: self.generation,
            pid: self.pid(),
        }
    }

    fn token(&self, kind: StreamKind) -> StreamToken {
        StreamToken {
            role: self.role,
            kind,
            generation: self.generation,
        }
    }

    fn has_stream(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::Stdout => self.stdout.is_some(),
            StreamKind::Stderr => self.stderr.is_some(),
        }
    }

    /// Borrowed descriptor for the given stream while it is still held.
    pub fn stream_fd(&self, kind: StreamKind) -> Option<BorrowedFd<'_>> {
        match kind {
            StreamKind::Stdout => self.stdout.as_ref().map(|s| s.as_fd()),
            StreamKind::Stderr => self.stderr.as_ref().map(|s| s.as_fd()),
        }
    }

    /// Performs one read from the given stream into `buf`.
    ///
    /// A released stream reads as end-of-stream.
    pub fn read_stream(&mut self, kind: StreamKind, buf: &mut [u8]) -> io::Result<usize> {
        match kind {
            StreamKind::Stdout => match self.stdout.as_mut() {
                Some(stream) => stream.read(buf),
                None => Ok(0),
            },
            StreamKind::Stderr => match self.stderr.as_mut() {
                Some(stream) => stream.read(buf),
                None => Ok(0),
            },
        }
    }

    /// Drops both pipes and removes their registrations. Returns how many
    /// registrations were removed; a second call removes none.
    fn release_streams(&mut self, reactor: &mut Reactor) -> usize {
        let mut released = 0;
        for kind in StreamKind::ALL {
            let held = match kind {
                StreamKind::Stdout => self.stdout.take().is_some(),
                StreamKind::Stderr => self.stderr.take().is_some(),
            };
            if held && reactor.deregister(self.token(kind)) {
                released += 1;
            }
        }
        self.live = false;
        released
    }

    /// Non-blocking reap. Returns the exit status the first time it is observed.
    fn poll_exit(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_some() {
            return None;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                Some(status)
            }
            Ok(None) => None,
            Err(err) => {
                warn!("Failed to query {} tool PID {}: {err}", self.role, self.pid());
                None
            }
        }
    }

    /// Sends SIGKILL to the process group and the process itself.
    ///
    /// Fire-and-forget: errors from an already exited child are swallowed and
    /// the exit is collected later by [`ProcessManager::reap`].
    fn terminate(&mut self) {
        self.poll_exit();
        if self.exit_status.is_some() {
            debug!("{} tool PID {} already exited", self.role, self.pid());
            return;
        }

        let pid = Pid::from_raw(self.pid() as i32);
        if let Err(err) = signal::killpg(pid, Signal::SIGKILL)
            && err != Errno::ESRCH
        {
            debug!("Failed to signal process group {pid} of {} tool: {err}", self.role);
        }
        if let Err(err) = signal::kill(pid, Signal::SIGKILL)
            && err != Errno::ESRCH
        {
            debug!("Failed to signal {} tool PID {pid}: {err}", self.role);
        }
        debug!("Sent SIGKILL to {} tool PID {pid}", self.role);

        self.poll_exit();
    }
}

fn set_nonblocking(stream: &impl AsRawFd, role: Role, kind: StreamKind) {
    let fd = stream.as_raw_fd();
    let result = fcntl(fd, FcntlArg::F_GETFL).and_then(|flags| {
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(flags))
    });
    if let Err(err) = result {
        warn!("Could not make {role} {kind} non-blocking: {err}");
    }
}

/// Owns the role-keyed process table.
#[derive(Debug, Default)]
pub struct ProcessManager {
    table: HashMap<Role, ManagedProcess>,
    retired: Vec<ManagedProcess>,
    next_generation: u64,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever occupies `role` with a freshly spawned `spec`.
    ///
    /// Both output streams of the new process are registered with `reactor`.
    /// Never waits for the child to exit.
    pub fn start(
        &mut self,
        role: Role,
        spec: &CommandSpec,
        reactor: &mut Reactor,
    ) -> Result<ProcessHandle, DialupError> {
        self.stop(role, reactor);

        let generation = self.next_generation;
        self.next_generation += 1;

        let process = ManagedProcess::spawn(role, generation, spec)?;
        for kind in StreamKind::ALL {
            if process.has_stream(kind) {
                reactor.register(process.token(kind));
            }
        }

        let handle = process.handle();
        self.table.insert(role, process);
        Ok(handle)
    }

    /// Kills and releases the process occupying `role`. Returns whether a
    /// process was present.
    pub fn stop(&mut self, role: Role, reactor: &mut Reactor) -> bool {
        let Some(mut process) = self.table.remove(&role) else {
            return false;
        };

        process.terminate();
        let released = process.release_streams(reactor);
        debug!(
            "Released {released} stream(s) of {role} tool PID {}",
            process.pid()
        );
        if process.exit_status.is_none() {
            self.retired.push(process);
        }
        true
    }

    /// Stops every role; used on supervisor shutdown.
    pub fn stop_all(&mut self, reactor: &mut Reactor) {
        for role in [Role::Connect, Role::Disconnect] {
            self.stop(role, reactor);
        }
        self.reap();
    }

    /// Marks the process behind `token` finished after its output ended.
    ///
    /// Streams are released but the process stays in its slot so that a later
    /// `start` or `stop` still terminates it if it lingers.
    pub fn finish(&mut self, token: StreamToken, reactor: &mut Reactor) -> bool {
        match self.table.get_mut(&token.role) {
            Some(process) if process.generation == token.generation && process.live => {
                process.release_streams(reactor);
                debug!(
                    "{} tool PID {} reached end of output",
                    token.role,
                    process.pid()
                );
                true
            }
            _ => false,
        }
    }

    /// Collects exit statuses without blocking. Returns newly observed exits of
    /// processes still in the table, and forgets retired processes once reaped.
    pub fn reap(&mut self) -> Vec<(Role, ExitStatus)> {
        let mut exits = Vec::new();
        for process in self.table.values_mut() {
            if let Some(status) = process.poll_exit() {
                info!("{} tool PID {} exited: {status}", process.role, process.pid());
                exits.push((process.role, status));
            }
        }

        self.retired.retain_mut(|process| {
            if let Some(status) = process.poll_exit() {
                debug!(
                    "Reaped replaced {} tool PID {}: {status}",
                    process.role,
                    process.pid()
                );
            }
            process.exit_status.is_none()
        });

        exits
    }

    /// Mutable access for the output relay, only when `token` is current.
    pub fn process_for_mut(&mut self, token: StreamToken) -> Option<&mut ManagedProcess> {
        self.table
            .get_mut(&token.role)
            .filter(|process| process.generation == token.generation)
    }

    /// Descriptor for the stream named by `token`, if it is current and held.
    pub fn stream_fd(&self, token: StreamToken) -> Option<BorrowedFd<'_>> {
        self.table
            .get(&token.role)
            .filter(|process| process.generation == token.generation)
            .and_then(|process| process.stream_fd(token.kind))
    }

    pub fn get(&self, role: Role) -> Option<&ManagedProcess> {
        self.table.get(&role)
    }

    pub fn is_live(&self, role: Role) -> bool {
        self.table.get(&role).is_some_and(ManagedProcess::is_live)
    }

    /// Number of processes that have been replaced or stopped but not yet reaped.
    pub fn pending_reap(&self) -> usize {
        self.retired.len()
    }
}
