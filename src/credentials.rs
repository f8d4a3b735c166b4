//! Dial-up credentials and their persisted store.
use std::{
    fmt, fs,
    io::Write,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CredentialsError;

/// Login details handed to the connect and disconnect tools.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub login: String,
    pub password: String,
    /// Selects the legacy provider endpoint instead of the standard one.
    pub legacy_endpoint: bool,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            login: String::new(),
            password: String::new(),
            legacy_endpoint: true,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("legacy_endpoint", &self.legacy_endpoint)
            .finish()
    }
}

/// A single edited field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialChange {
    Login(String),
    Password(String),
    LegacyEndpoint(bool),
}

impl Credentials {
    /// Applies an edit. Returns whether the value actually changed.
    pub fn apply(&mut self, change: CredentialChange) -> bool {
        match change {
            CredentialChange::Login(login) if login != self.login => self.login = login,
            CredentialChange::Password(password) if password != self.password => {
                self.password = password
            }
            CredentialChange::LegacyEndpoint(legacy) if legacy != self.legacy_endpoint => {
                self.legacy_endpoint = legacy
            }
            _ => return false,
        }
        true
    }
}

/// Credentials loaded from disk plus a dirty flag.
///
/// Loading never fails; a missing or unreadable file yields defaults. Writes
/// happen only through [`CredentialStore::flush`] and only when dirty.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    current: Credentials,
    dirty: bool,
}

impl CredentialStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = match read_credentials(&path) {
            Ok(Some(credentials)) => {
                debug!("Loaded credentials for '{}' from {:?}", credentials.login, path);
                credentials
            }
            Ok(None) => {
                debug!("No credentials file at {:?}; using defaults", path);
                Credentials::default()
            }
            Err(err) => {
                warn!("Ignoring unreadable credentials file {:?}: {err}", path);
                Credentials::default()
            }
        };

        Self {
            path,
            current,
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn credentials(&self) -> &Credentials {
        &self.current
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn apply(&mut self, change: CredentialChange) -> bool {
        let changed = self.current.apply(change);
        self.dirty |= changed;
        changed
    }

    /// Replaces the whole record; last write wins.
    pub fn replace(&mut self, credentials: Credentials) -> bool {
        if credentials == self.current {
            return false;
        }
        self.current = credentials;
        self.dirty = true;
        true
    }

    /// Writes the credentials if they changed since the last load or flush.
    /// Returns whether a write happened.
    pub fn flush(&mut self) -> Result<bool, CredentialsError> {
        if !self.dirty {
            return Ok(false);
        }
        write_credentials(&self.path, &self.current)?;
        self.dirty = false;
        info!("Saved credentials to {:?}", self.path);
        Ok(true)
    }
}

fn read_credentials(path: &Path) -> Result<Option<Credentials>, CredentialsError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_yaml::from_str(&content)?))
}

fn write_credentials(path: &Path, credentials: &Credentials) -> Result<(), CredentialsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let payload = serde_yaml::to_string(credentials)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies when the file is created.
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(payload.as_bytes())?;
    file.flush()?;
    Ok(())
}
