#[path = "common/mod.rs"]
mod common;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{fs, path::Path};

use assert_cmd::Command;
use common::runtime_dir;
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
fn help_lists_subcommands() {
    let temp = tempdir().expect("failed to create tempdir");

    dialup(temp.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("set-credentials"))
        .stdout(predicate::str::contains("interfaces"))
        .stdout(predicate::str::contains("shutdown"));
}

#[test]
fn rejects_invalid_log_level() {
    let temp = tempdir().expect("failed to create tempdir");

    dialup(temp.path())
        .args(["--log-level", "chatty", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid log level"));
}

#[test]
fn set_credentials_without_supervisor_writes_store() {
    let temp = tempdir().expect("failed to create tempdir");
    let home = temp.path();

    dialup(home)
        .args([
            "set-credentials",
            "--login",
            "alice",
            "--password",
            "pw",
            "--legacy",
            "false",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Updated 3 credential field(s)"));

    let path = home.join(".config/dialup/credentials.yaml");
    let saved = fs::read_to_string(&path).expect("credentials should be saved");
    assert!(saved.contains("login: alice"));
    assert!(saved.contains("legacy_endpoint: false"));

    #[cfg(unix)]
    {
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    dialup(home)
        .args(["set-credentials", "--login", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Updated 0 credential field(s)"));
}

#[test]
fn status_without_supervisor_reports_local_view() {
    let temp = tempdir().expect("failed to create tempdir");
    let home = temp.path();
    let config_dir = home.join(".config/dialup");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(
        config_dir.join("credentials.yaml"),
        "login: bob\npassword: secret\nlegacy_endpoint: true\n",
    )
    .unwrap();

    dialup(home)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Connection: "))
        .stdout(predicate::str::contains("Login: bob"))
        .stdout(predicate::str::contains("Endpoint: dsl-provider-legacy"))
        .stdout(predicate::str::contains("secret").not());
}

#[test]
fn status_json_is_machine_readable() {
    let temp = tempdir().expect("failed to create tempdir");

    let output = dialup(temp.path())
        .args(["status", "--json"])
        .output()
        .expect("failed to run status");
    assert!(output.status.success());

    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("status output should be JSON");
    assert_eq!(report["login"], "");
    assert_eq!(report["endpoint"], "dsl-provider-legacy");
    assert!(report["affordances"]["connect_enabled"].is_boolean());
    assert!(report["connect_pid"].is_null());
}

#[test]
fn malformed_credentials_fall_back_to_defaults() {
    let temp = tempdir().expect("failed to create tempdir");
    let home = temp.path();
    let config_dir = home.join(".config/dialup");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(config_dir.join("credentials.yaml"), "login: [oops\n").unwrap();

    dialup(home)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Endpoint: dsl-provider-legacy"));
}

#[test]
fn invalid_config_is_rejected() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = temp.path().join("bad.yaml");
    fs::write(&config, "poll_interval: \"0s\"\n").unwrap();

    dialup(temp.path())
        .args(["status", "--config", config.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("poll_interval"));
}

#[test]
fn missing_explicit_config_is_rejected() {
    let temp = tempdir().expect("failed to create tempdir");

    dialup(temp.path())
        .args(["interfaces", "--config", "/nonexistent/dialup.yaml"])
        .assert()
        .failure();
}

#[test]
fn commands_without_supervisor_warn_and_succeed() {
    let temp = tempdir().expect("failed to create tempdir");

    for command in ["connect", "disconnect", "shutdown"] {
        dialup(temp.path())
            .arg(command)
            .assert()
            .success()
            .stderr(predicate::str::contains("No running dialup supervisor"));
    }
}

#[test]
fn stale_pid_file_is_cleaned_up() {
    let temp = tempdir().expect("failed to create tempdir");
    let home = temp.path();
    let runtime = runtime_dir(home);
    fs::create_dir_all(&runtime).unwrap();
    let pid_file = runtime.join("dialup.pid");
    fs::write(&pid_file, "999999").unwrap();

    dialup(home).arg("status").assert().success();

    assert!(!pid_file.exists(), "stale PID file should be removed");
}

#[cfg(target_os = "linux")]
#[test]
fn interfaces_lists_loopback() {
    let temp = tempdir().expect("failed to create tempdir");

    dialup(temp.path())
        .arg("interfaces")
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"(?m)^lo$").unwrap())
        .stdout(predicate::str::contains("Connection: "));
}
