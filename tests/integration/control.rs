#[path = "common/mod.rs"]
mod common;

use std::{fs, path::Path};

use assert_cmd::Command;
use common::{
    HomeEnvGuard, runtime_dir, spawn_supervisor, wait_for_contents, wait_for_exit,
    write_config,
};
use dialup::{
    interfaces::ConnectionStatus,
    ipc::{self, ControlCommand, ControlResponse},
};
use predicates::prelude::*;
use tempfile::tempdir;

fn dialup(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("dialup").expect("binary should build");
    cmd.env("HOME", home)
        .env_remove("RUST_LOG")
        .current_dir(home);
    cmd
}

#[test]
fn cli_drives_resident_supervisor() {
    let temp = tempdir().expect("failed to create tempdir");
    let home = temp.path();
    let config = write_config(
        home,
        "echo dialing {login} {endpoint}",
        "echo hangup {endpoint}",
    );
    let mut supervisor = spawn_supervisor(home, &config);

    dialup(home)
        .args([
            "set-credentials",
            "--login",
            "carol",
            "--password",
            "pw",
            "--legacy",
            "false",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Updated 3 credential field(s)"));

    let output = dialup(home)
        .args(["status", "--json"])
        .output()
        .expect("failed to run status");
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["login"], "carol");
    assert_eq!(report["endpoint"], "dsl-provider");

    dialup(home)
        .arg("connect")
        .assert()
        .success()
        .stdout(predicate::str::contains("Connect tool started"));

    let log_path = home.join("dial.log");
    let log = wait_for_contents(&log_path, "dialing carol dsl-provider");
    assert!(log.contains("Connecting..."));

    dialup(home)
        .arg("disconnect")
        .assert()
        .success()
        .stdout(predicate::str::contains("Disconnect tool started"));
    wait_for_contents(&log_path, "hangup dsl-provider");

    let saved = fs::read_to_string(home.join(".config/dialup/credentials.yaml")).unwrap();
    assert!(saved.contains("carol"));

    dialup(home).arg("shutdown").assert().success();
    wait_for_exit(&mut supervisor);

    assert!(!runtime_dir(home).join("control.sock").exists());
    assert!(!runtime_dir(home).join("dialup.pid").exists());
}

#[test]
fn control_socket_answers_library_clients() {
    let temp = tempdir().expect("failed to create tempdir");
    let home = temp.path();
    let config = write_config(home, "true", "true");
    let mut supervisor = spawn_supervisor(home, &config);
    let _home = HomeEnvGuard::set(home);

    let pid = ipc::read_supervisor_pid()
        .unwrap()
        .expect("supervisor should record its PID");
    assert_eq!(pid as u32, supervisor.id());

    match ipc::send_command(&ControlCommand::Status).unwrap() {
        ControlResponse::Status(report) => {
            assert!(matches!(
                report.status,
                ConnectionStatus::Online | ConnectionStatus::Offline
            ));
            assert_eq!(report.endpoint, "dsl-provider-legacy");
            assert_eq!(report.connect_pid, None);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    assert_eq!(
        ipc::send_command(&ControlCommand::Shutdown).unwrap(),
        ControlResponse::Ok
    );
    wait_for_exit(&mut supervisor);
}

#[test]
fn duplicate_run_is_refused() {
    let temp = tempdir().expect("failed to create tempdir");
    let home = temp.path();
    let config = write_config(home, "true", "true");
    let mut supervisor = spawn_supervisor(home, &config);

    dialup(home)
        .args(["run", "--config", config.to_str().unwrap()])
        .assert()
        .success()
        .stderr(predicate::str::contains("already running"));

    dialup(home).arg("shutdown").assert().success();
    wait_for_exit(&mut supervisor);
}
