//! Connection supervisor: polls link state and drives the dial-up tools.
use std::{
    collections::HashMap,
    io,
    os::{fd::AsFd, unix::net::UnixListener},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender, TryRecvError},
    },
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::Config,
    constants::{
        CONNECTING_MARKER, CONTROL_ACCEPT_BATCH, CONTROL_IDLE_TIMEOUT, DISCONNECTING_MARKER,
    },
    credentials::{CredentialChange, CredentialStore, Credentials},
    error::DialupError,
    interfaces::{Classifier, ConnectionStatus, InterfaceSource},
    ipc::{self, ConnectionEvent, ControlCommand, ControlConnection, ControlResponse},
    logs::{LogSink, timestamped},
    process::{ProcessHandle, ProcessManager, Role},
    reactor::{ClientInterest, Reactor, Readiness},
    relay::OutputRelay,
};

/// Which user actions currently make sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affordances {
    pub connect_enabled: bool,
    pub disconnect_enabled: bool,
}

impl Affordances {
    pub fn for_status(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Offline => Self {
                connect_enabled: true,
                disconnect_enabled: false,
            },
            ConnectionStatus::Online => Self {
                connect_enabled: false,
                disconnect_enabled: true,
            },
        }
    }
}

/// Observer for published status and affordance changes.
pub trait StatusListener {
    fn status_changed(&mut self, _previous: ConnectionStatus, _current: ConnectionStatus) {}

    fn affordances_changed(&mut self, _affordances: Affordances) {}
}

/// Snapshot returned to control clients. Never carries the password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: ConnectionStatus,
    pub affordances: Affordances,
    pub login: String,
    pub endpoint: String,
    pub connect_pid: Option<u32>,
    pub disconnect_pid: Option<u32>,
}

/// Single-threaded supervisor owning the process table, the reactor and the
/// credential store.
pub struct Supervisor {
    config: Config,
    classifier: Classifier,
    poll_interval: Duration,
    source: Box<dyn InterfaceSource>,
    processes: ProcessManager,
    reactor: Reactor,
    relay: OutputRelay,
    credentials: CredentialStore,
    changes_tx: Sender<CredentialChange>,
    changes_rx: Receiver<CredentialChange>,
    status: ConnectionStatus,
    affordances: Affordances,
    listeners: Vec<Box<dyn StatusListener>>,
    control: Option<UnixListener>,
    clients: HashMap<u64, ControlConnection>,
    next_client: u64,
    stop_requested: bool,
}

impl Supervisor {
    /// Builds a supervisor; credentials are loaded from the configured path.
    pub fn new(
        config: Config,
        source: impl InterfaceSource + 'static,
        sink: impl LogSink + Send + 'static,
    ) -> Result<Self, DialupError> {
        let classifier = config.classifier()?;
        let poll_interval = config.poll_interval()?;
        let credentials = CredentialStore::load(config.credentials_path());
        let (changes_tx, changes_rx) = mpsc::channel();
        let status = ConnectionStatus::Offline;

        debug!(
            "Supervisor polling every {:?} for interfaces matching '{}'",
            poll_interval,
            classifier.pattern()
        );

        Ok(Self {
            config,
            classifier,
            poll_interval,
            source: Box::new(source),
            processes: ProcessManager::new(),
            reactor: Reactor::new(),
            relay: OutputRelay::new(sink),
            credentials,
            changes_tx,
            changes_rx,
            status,
            affordances: Affordances::for_status(status),
            listeners: Vec::new(),
            control: None,
            clients: HashMap::new(),
            next_client: 0,
            stop_requested: false,
        })
    }

    pub fn add_listener(&mut self, listener: impl StatusListener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Last published connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn affordances(&self) -> Affordances {
        self.affordances
    }

    pub fn credentials(&self) -> &Credentials {
        self.credentials.credentials()
    }

    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Number of accepted control connections still open.
    pub fn control_clients(&self) -> usize {
        self.clients.len()
    }

    /// Sender through which edits to the credentials are delivered. Edits are
    /// applied on the supervisor's thread by [`Supervisor::apply_credential_changes`].
    pub fn credential_sender(&self) -> Sender<CredentialChange> {
        self.changes_tx.clone()
    }

    /// Applies every queued credential edit. Returns how many changed a value.
    pub fn apply_credential_changes(&mut self) -> usize {
        let mut changed = 0;
        loop {
            match self.changes_rx.try_recv() {
                Ok(change) => {
                    if self.credentials.apply(change) {
                        changed += 1;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if changed > 0 {
            debug!("Applied {changed} credential edit(s)");
        }
        changed
    }

    /// Polls the interface list once. Returns the new status if it changed.
    ///
    /// Repeated ticks over an unchanged interface list publish nothing.
    pub fn tick(&mut self) -> Option<ConnectionStatus> {
        self.reap_children();

        let interfaces = self.source.list_interfaces();
        let verdict = self.classifier.classify(&interfaces);
        if verdict == self.status {
            return None;
        }

        let previous = self.status;
        self.status = verdict;
        info!("Connection status changed: {previous} -> {verdict}");
        for listener in &mut self.listeners {
            listener.status_changed(previous, verdict);
        }
        self.set_affordances(Affordances::for_status(verdict));
        Some(verdict)
    }

    /// Launches the connect tool with `credentials`, replacing any running one.
    pub fn connect(&mut self, credentials: Credentials) -> Result<ProcessHandle, DialupError> {
        self.credentials.replace(credentials);
        self.launch(Role::Connect)
    }

    /// Launches the connect tool with the stored credentials.
    pub fn connect_saved(&mut self) -> Result<ProcessHandle, DialupError> {
        self.launch(Role::Connect)
    }

    /// Launches the disconnect tool, replacing any running one.
    pub fn disconnect(&mut self) -> Result<ProcessHandle, DialupError> {
        self.launch(Role::Disconnect)
    }

    fn launch(&mut self, role: Role) -> Result<ProcessHandle, DialupError> {
        self.apply_credential_changes();
        self.persist_credentials();

        let marker = match role {
            Role::Connect => CONNECTING_MARKER,
            Role::Disconnect => DISCONNECTING_MARKER,
        };
        self.relay.append(&timestamped(marker));

        let spec = self.config.command_for(role, self.credentials.credentials());
        info!("Running {role} tool: {spec}");
        let started = self.processes.start(role, &spec, &mut self.reactor);
        self.relay.discard_released(&self.reactor);
        let handle = match started {
            Ok(handle) => handle,
            Err(err) => {
                self.relay.append(&timestamped(&err.to_string()));
                return Err(err);
            }
        };

        self.set_affordances(match role {
            Role::Connect => Affordances {
                connect_enabled: false,
                disconnect_enabled: true,
            },
            Role::Disconnect => Affordances {
                connect_enabled: true,
                disconnect_enabled: false,
            },
        });
        Ok(handle)
    }

    fn persist_credentials(&mut self) {
        if let Err(err) = self.credentials.flush() {
            warn!(
                "Failed to save credentials to {:?}: {err}",
                self.credentials.path()
            );
        }
    }

    fn set_affordances(&mut self, affordances: Affordances) {
        if affordances == self.affordances {
            return;
        }
        self.affordances = affordances;
        for listener in &mut self.listeners {
            listener.affordances_changed(affordances);
        }
    }

    fn reap_children(&mut self) {
        for (role, status) in self.processes.reap() {
            self.relay
                .append(&timestamped(&format!("{role} tool exited: {status}")));
        }
    }

    /// Waits up to `timeout` for output or control traffic and handles
    /// whatever became ready. Returns the number of ready sources.
    pub fn pump(&mut self, timeout: Duration) -> Result<usize, DialupError> {
        let ready = {
            let control = self.control.as_ref().map(|listener| listener.as_fd());
            let clients: Vec<ClientInterest<'_>> = self
                .clients
                .iter()
                .map(|(id, connection)| ClientInterest {
                    id: *id,
                    fd: connection.as_fd(),
                    writable: connection.wants_write(),
                })
                .collect();
            self.reactor
                .wait(&self.processes, control, &clients, timeout)?
        };

        for readiness in &ready {
            match *readiness {
                Readiness::Stream(token) => {
                    self.relay
                        .on_readable(token, &mut self.processes, &mut self.reactor);
                }
                Readiness::Control => self.accept_control(),
                Readiness::Client(id) => self.service_client(id),
            }
        }
        self.expire_clients();
        Ok(ready.len())
    }

    /// Binds the control socket, replacing stale runtime files, and records
    /// this process as the resident supervisor.
    pub fn bind_control(&mut self) -> Result<(), DialupError> {
        ipc::cleanup_runtime()?;
        let socket_path = ipc::socket_path()?;
        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        ipc::write_supervisor_pid(std::process::id() as libc::pid_t)?;
        info!("Listening for control commands on {:?}", socket_path);
        self.control = Some(listener);
        Ok(())
    }

    fn accept_control(&mut self) {
        for _ in 0..CONTROL_ACCEPT_BATCH {
            let accepted = match self.control.as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };
            let stream = match accepted {
                Ok((stream, _)) => stream,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!("Failed to accept control connection: {err}");
                    return;
                }
            };

            match ControlConnection::new(stream) {
                Ok(connection) => {
                    let id = self.next_client;
                    self.next_client += 1;
                    trace!("Accepted control connection {id}");
                    self.clients.insert(id, connection);
                }
                Err(err) => warn!("Failed to configure control connection: {err}"),
            }
        }
    }

    fn service_client(&mut self, id: u64) {
        let Some(connection) = self.clients.get_mut(&id) else {
            return;
        };

        if connection.wants_write() {
            self.flush_client(id);
            return;
        }

        let response = match connection.read_available() {
            Ok(ConnectionEvent::Pending) => return,
            Ok(ConnectionEvent::Closed) => {
                trace!("Control connection {id} closed");
                self.clients.remove(&id);
                return;
            }
            Ok(ConnectionEvent::Command(command)) => self.handle_command(command),
            Err(err) => {
                debug!("Discarding malformed control request: {err}");
                ControlResponse::Error(err.to_string())
            }
        };
        self.respond(id, &response);
    }

    fn respond(&mut self, id: u64, response: &ControlResponse) {
        let Some(connection) = self.clients.get_mut(&id) else {
            return;
        };
        if let Err(err) = connection.queue_response(response) {
            debug!("Failed to encode control response: {err}");
            self.clients.remove(&id);
            return;
        }
        self.flush_client(id);
    }

    /// Writes what the socket takes; the connection is dropped once the
    /// response is out or the client stopped listening.
    fn flush_client(&mut self, id: u64) {
        let Some(connection) = self.clients.get_mut(&id) else {
            return;
        };
        match connection.flush() {
            Ok(false) => {}
            Ok(true) => {
                self.clients.remove(&id);
            }
            Err(err) => {
                debug!("Failed to answer control client: {err}");
                self.clients.remove(&id);
            }
        }
    }

    fn expire_clients(&mut self) {
        let before = self.clients.len();
        self.clients
            .retain(|_, connection| connection.opened().elapsed() < CONTROL_IDLE_TIMEOUT);
        let expired = before - self.clients.len();
        if expired > 0 {
            debug!("Closed {expired} idle control connection(s)");
        }
    }

    /// Executes a control command on the supervisor thread.
    pub fn handle_command(&mut self, command: ControlCommand) -> ControlResponse {
        info!("Received control command: {}", command_name(&command));
        match command {
            ControlCommand::Connect => match self.connect_saved() {
                Ok(handle) => {
                    ControlResponse::Message(format!("Connect tool started (PID {})", handle.pid))
                }
                Err(err) => ControlResponse::Error(err.to_string()),
            },
            ControlCommand::Disconnect => match self.disconnect() {
                Ok(handle) => ControlResponse::Message(format!(
                    "Disconnect tool started (PID {})",
                    handle.pid
                )),
                Err(err) => ControlResponse::Error(err.to_string()),
            },
            ControlCommand::Status => ControlResponse::Status(self.status_report()),
            ControlCommand::SetCredentials {
                login,
                password,
                legacy_endpoint,
            } => {
                let changes = login
                    .map(CredentialChange::Login)
                    .into_iter()
                    .chain(password.map(CredentialChange::Password))
                    .chain(legacy_endpoint.map(CredentialChange::LegacyEndpoint));
                for change in changes {
                    let _ = self.changes_tx.send(change);
                }
                let changed = self.apply_credential_changes();
                ControlResponse::Message(format!("Updated {changed} credential field(s)"))
            }
            ControlCommand::Shutdown => {
                self.stop_requested = true;
                ControlResponse::Ok
            }
        }
    }

    pub fn status_report(&self) -> StatusReport {
        let credentials = self.credentials.credentials();
        let running_pid = |role: Role| {
            self.processes
                .get(role)
                .filter(|process| process.exit_status().is_none())
                .map(|process| process.pid())
        };
        StatusReport {
            status: self.status,
            affordances: self.affordances,
            login: credentials.login.clone(),
            endpoint: self.config.endpoint_for(credentials).to_string(),
            connect_pid: running_pid(Role::Connect),
            disconnect_pid: running_pid(Role::Disconnect),
        }
    }

    /// Runs the event loop until `shutdown` is set or a shutdown command arrives.
    ///
    /// Polling continues through transient errors; only shutdown ends the loop.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), DialupError> {
        info!("Supervisor started");
        let mut next_tick = Instant::now();

        while !shutdown.load(Ordering::SeqCst) && !self.stop_requested {
            if Instant::now() >= next_tick {
                self.tick();
                next_tick = Instant::now() + self.poll_interval;
            }
            self.apply_credential_changes();

            let timeout = next_tick.saturating_duration_since(Instant::now());
            if let Err(err) = self.pump(timeout) {
                error!("Readiness wait failed: {err}");
                thread::sleep(timeout);
            }
        }

        self.shutdown();
        info!("Supervisor stopped");
        Ok(())
    }

    /// Kills any running tools, closes control connections and removes
    /// control runtime files.
    pub fn shutdown(&mut self) {
        self.processes.stop_all(&mut self.reactor);
        self.relay.discard_released(&self.reactor);
        self.clients.clear();
        if self.control.take().is_some()
            && let Err(err) = ipc::cleanup_runtime()
        {
            warn!("Failed to clean up control runtime: {err}");
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn command_name(command: &ControlCommand) -> &'static str {
    match command {
        ControlCommand::Connect => "connect",
        ControlCommand::Disconnect => "disconnect",
        ControlCommand::Status => "status",
        ControlCommand::SetCredentials { .. } => "set_credentials",
        ControlCommand::Shutdown => "shutdown",
    }
}
