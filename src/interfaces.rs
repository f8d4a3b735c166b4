//! Network interface enumeration and PPP link classification.
use std::{fmt, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, warn};

use crate::{constants::DEFAULT_INTERFACE_PATTERN, error::DialupError};

/// Name of a network interface as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceName(String);

impl InterfaceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InterfaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InterfaceName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Binary verdict derived from the interface list on every poll.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionStatus {
    Online,
    Offline,
}

impl ConnectionStatus {
    /// Capitalised form shown to users.
    pub fn label(self) -> &'static str {
        match self {
            ConnectionStatus::Online => "Online",
            ConnectionStatus::Offline => "Offline",
        }
    }
}

/// Anything that can report the current set of interface names.
///
/// The supervisor polls through this trait so hosts and tests can substitute
/// their own view of the network.
pub trait InterfaceSource {
    fn list_interfaces(&mut self) -> Vec<InterfaceName>;
}

/// Queries the kernel with `if_nameindex(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn list_interfaces(&mut self) -> Vec<InterfaceName> {
        list_interfaces()
    }
}

/// Lists every interface registered with the kernel, up or down.
///
/// Failures are logged and reported as an empty list so callers see "offline"
/// instead of an error.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub fn list_interfaces() -> Vec<InterfaceName> {
    match nix::net::if_::if_nameindex() {
        Ok(interfaces) => interfaces
            .iter()
            .map(|iface| InterfaceName::new(iface.name().to_string_lossy()))
            .collect(),
        Err(err) => {
            warn!("Interface enumeration failed: {err}");
            Vec::new()
        }
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
pub fn list_interfaces() -> Vec<InterfaceName> {
    debug!("Interface enumeration unsupported on this platform");
    Vec::new()
}

static DEFAULT_CLASSIFIER: LazyLock<Classifier> = LazyLock::new(Classifier::default);

/// Classifies with the default `^ppp[0-9]*` rule.
pub fn classify(interfaces: &[InterfaceName]) -> ConnectionStatus {
    DEFAULT_CLASSIFIER.classify(interfaces)
}

/// Decides online/offline from interface names.
///
/// A name counts when the pattern matches at its start; trailing characters
/// are not checked, so `ppplink` is treated as a PPP link.
#[derive(Debug, Clone)]
pub struct Classifier {
    pattern: Regex,
}

impl Classifier {
    /// Builds a classifier from a user supplied pattern. The pattern is anchored
    /// at the start of the interface name if it is not already.
    pub fn new(pattern: &str) -> Result<Self, DialupError> {
        let anchored = if pattern.starts_with('^') {
            pattern.to_string()
        } else {
            format!("^(?:{pattern})")
        };
        let pattern = Regex::new(&anchored).map_err(|err| {
            DialupError::ConfigInvalid(format!(
                "interface_pattern '{pattern}' is not a valid regex: {err}"
            ))
        })?;
        Ok(Self { pattern })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn classify(&self, interfaces: &[InterfaceName]) -> ConnectionStatus {
        match interfaces
            .iter()
            .find(|name| self.pattern.is_match(name.as_str()))
        {
            Some(name) => {
                debug!("Interface '{name}' indicates an active PPP link");
                ConnectionStatus::Online
            }
            None => ConnectionStatus::Offline,
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            pattern: Regex::new(DEFAULT_INTERFACE_PATTERN)
                .expect("default interface pattern is a valid regex"),
        }
    }
}
