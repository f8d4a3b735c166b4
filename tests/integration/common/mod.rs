#![allow(dead_code)]

use std::{
    env, fs,
    path::{Path, PathBuf},
    process::{Child, Command},
    thread,
    time::{Duration, Instant},
};

use assert_cmd::cargo::CommandCargoExt;

pub struct HomeEnvGuard {
    previous: Option<String>,
    _lock: std::sync::MutexGuard<'static, ()>,
}

impl HomeEnvGuard {
    pub fn set(home: &Path) -> Self {
        let lock = dialup::test_utils::env_lock();
        let previous = env::var("HOME").ok();
        unsafe {
            env::set_var("HOME", home);
        }
        Self {
            previous,
            _lock: lock,
        }
    }
}

impl Drop for HomeEnvGuard {
    fn drop(&mut self) {
        match &self.previous {
            Some(value) => unsafe {
                env::set_var("HOME", value);
            },
            None => unsafe {
                env::remove_var("HOME");
            },
        }
    }
}

pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        if Instant::now() >= deadline {
            panic!("Timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(50));
    }
}

pub fn wait_for_path(path: &Path) {
    wait_until(&format!("{path:?} to exist"), || path.exists());
}

pub fn wait_for_contents(path: &Path, needle: &str) -> String {
    let mut contents = String::new();
    wait_until(&format!("'{needle}' in {path:?}"), || {
        contents = fs::read_to_string(path).unwrap_or_default();
        contents.contains(needle)
    });
    contents
}

pub fn runtime_dir(home: &Path) -> PathBuf {
    home.join(".local/share/dialup")
}

/// Writes a config whose tools are `sh -c` scripts.
pub fn write_config(dir: &Path, connect_script: &str, disconnect_script: &str) -> PathBuf {
    let path = dir.join("dialup.yaml");
    let config = format!(
        r#"poll_interval: "100ms"
log_file: "{log}"
connect:
  command: "sh"
  args: ["-c", "{connect_script}"]
disconnect:
  command: "sh"
  args: ["-c", "{disconnect_script}"]
"#,
        log = dir.join("dial.log").display(),
    );
    fs::write(&path, config).expect("failed to write config");
    path
}

/// Starts `dialup run` in the background with `HOME` pointing at `home`.
pub fn spawn_supervisor(home: &Path, config: &Path) -> Child {
    let child = Command::cargo_bin("dialup")
        .expect("binary should build")
        .arg("run")
        .arg("--config")
        .arg(config)
        .env("HOME", home)
        .env_remove("RUST_LOG")
        .current_dir(home)
        .spawn()
        .expect("failed to spawn supervisor");
    wait_for_path(&runtime_dir(home).join("control.sock"));
    wait_for_path(&runtime_dir(home).join("dialup.pid"));
    child
}

pub fn wait_for_exit(child: &mut Child) {
    wait_until("supervisor to exit", || {
        matches!(child.try_wait(), Ok(Some(_)))
    });
}
