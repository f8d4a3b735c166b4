#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    sync::{Arc, Mutex},
    time::Duration,
};

use common::wait_until;
use dialup::{
    config::{Config, ToolConfig},
    credentials::Credentials,
    interfaces::{ConnectionStatus, InterfaceName, InterfaceSource},
    logs::{FileSink, MemorySink},
    process::Role,
    supervisor::{Affordances, StatusListener, Supervisor},
};
use tempfile::tempdir;

/// Interface list that tests can swap while the supervisor holds the source.
#[derive(Clone, Default)]
struct SharedInterfaces(Arc<Mutex<Vec<InterfaceName>>>);

impl SharedInterfaces {
    fn set(&self, names: &[&str]) {
        *self.0.lock().unwrap() = names.iter().copied().map(InterfaceName::from).collect();
    }
}

impl InterfaceSource for SharedInterfaces {
    fn list_interfaces(&mut self) -> Vec<InterfaceName> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Clone, Default)]
struct Transitions(Arc<Mutex<Vec<(ConnectionStatus, ConnectionStatus)>>>);

impl StatusListener for Transitions {
    fn status_changed(&mut self, previous: ConnectionStatus, current: ConnectionStatus) {
        self.0.lock().unwrap().push((previous, current));
    }
}

fn sh(script: &str) -> ToolConfig {
    ToolConfig {
        command: "sh".into(),
        args: vec!["-c".into(), script.into()],
    }
}

fn config(dir: &std::path::Path, connect: &str, disconnect: &str) -> Config {
    Config {
        credentials_path: Some(dir.join("credentials.yaml")),
        connect: sh(connect),
        disconnect: sh(disconnect),
        ..Config::default()
    }
}

fn pump_until_idle(supervisor: &mut Supervisor) {
    wait_until("tool output to end", || {
        supervisor.pump(Duration::from_millis(50)).unwrap();
        supervisor.reactor().registered_count() == 0
    });
}

#[test]
fn dial_session_end_to_end() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let interfaces = SharedInterfaces::default();
    let transitions = Transitions::default();
    let log_path = dir.join("logs/dial.log");

    let mut supervisor = Supervisor::new(
        config(
            dir,
            "echo \"dialing {login} via {endpoint}\"; echo 'LCP up' >&2",
            "echo \"hanging up {endpoint}\"",
        ),
        interfaces.clone(),
        FileSink::open(&log_path).unwrap(),
    )
    .unwrap();
    supervisor.add_listener(transitions.clone());

    interfaces.set(&["lo", "eth0"]);
    assert_eq!(supervisor.tick(), None);

    supervisor
        .connect(Credentials {
            login: "alice".into(),
            password: "x".into(),
            legacy_endpoint: false,
        })
        .unwrap();
    pump_until_idle(&mut supervisor);

    interfaces.set(&["lo", "eth0", "ppp0"]);
    assert_eq!(supervisor.tick(), Some(ConnectionStatus::Online));
    assert_eq!(supervisor.tick(), None);
    assert_eq!(
        supervisor.affordances(),
        Affordances {
            connect_enabled: false,
            disconnect_enabled: true
        }
    );

    supervisor.disconnect().unwrap();
    pump_until_idle(&mut supervisor);

    interfaces.set(&["lo", "eth0"]);
    assert_eq!(supervisor.tick(), Some(ConnectionStatus::Offline));
    assert!(supervisor.affordances().connect_enabled);

    assert_eq!(
        *transitions.0.lock().unwrap(),
        vec![
            (ConnectionStatus::Offline, ConnectionStatus::Online),
            (ConnectionStatus::Online, ConnectionStatus::Offline),
        ]
    );

    let log = fs::read_to_string(&log_path).unwrap();
    let connecting = log.find("Connecting...").unwrap();
    let dialing = log.find("dialing alice via dsl-provider\n").unwrap();
    let disconnecting = log.find("Disconnecting...").unwrap();
    let hanging_up = log.find("hanging up dsl-provider\n").unwrap();
    assert!(connecting < dialing);
    assert!(dialing < disconnecting);
    assert!(disconnecting < hanging_up);
    assert!(log.contains("LCP up\n"));
    assert!(!log.contains(" x "));
}

#[test]
fn large_output_does_not_stall() {
    let temp = tempdir().expect("failed to create tempdir");
    let sink = MemorySink::new();
    let mut supervisor = Supervisor::new(
        config(
            temp.path(),
            "i=0; while [ $i -lt 4000 ]; do echo line-$i; i=$((i+1)); done",
            "true",
        ),
        SharedInterfaces::default(),
        sink.clone(),
    )
    .unwrap();

    supervisor.connect_saved().unwrap();
    pump_until_idle(&mut supervisor);

    let expected: String = (0..4000).map(|index| format!("line-{index}\n")).collect();
    let contents = sink.contents();
    assert!(contents.starts_with('['));
    assert!(contents.ends_with(&expected));
}

#[test]
fn replaced_tool_is_killed_and_reaped() {
    let temp = tempdir().expect("failed to create tempdir");
    let mut supervisor = Supervisor::new(
        config(temp.path(), "sleep 30", "sleep 30"),
        SharedInterfaces::default(),
        MemorySink::new(),
    )
    .unwrap();

    let first = supervisor.connect_saved().unwrap();
    let second = supervisor.connect_saved().unwrap();
    supervisor.disconnect().unwrap();

    assert_ne!(first.pid, second.pid);
    assert_eq!(supervisor.reactor().registered_count(), 4);
    assert_eq!(supervisor.reactor().deregistration_count(), 2);

    wait_until("replaced tool to be reaped", || {
        supervisor.tick();
        supervisor.processes().pending_reap() == 0
    });

    let report = supervisor.status_report();
    assert_eq!(report.connect_pid, Some(second.pid));
    assert!(report.disconnect_pid.is_some());

    supervisor.shutdown();
    assert_eq!(supervisor.reactor().registered_count(), 0);
    assert!(!supervisor.processes().is_live(Role::Connect));
    assert!(!supervisor.processes().is_live(Role::Disconnect));
}

#[test]
fn failed_spawn_leaves_supervisor_usable() {
    let temp = tempdir().expect("failed to create tempdir");
    let sink = MemorySink::new();
    let mut cfg = config(temp.path(), "true", "echo bye");
    cfg.connect = ToolConfig {
        command: temp.path().join("no-such-dialer").display().to_string(),
        args: Vec::new(),
    };
    let mut supervisor =
        Supervisor::new(cfg, SharedInterfaces::default(), sink.clone()).unwrap();

    assert!(supervisor.connect_saved().is_err());
    assert_eq!(supervisor.reactor().registered_count(), 0);

    supervisor.disconnect().unwrap();
    pump_until_idle(&mut supervisor);
    assert!(sink.contents().contains("bye\n"));
}
