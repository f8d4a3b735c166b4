//! Configuration management for the dial-up supervisor.
use regex::Regex;
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use crate::{
    constants::{
        CONFIG_FILE_NAME, DEFAULT_CONNECT_ARGS, DEFAULT_CONNECT_COMMAND,
        DEFAULT_DISCONNECT_ARGS, DEFAULT_DISCONNECT_COMMAND, DEFAULT_INTERFACE_PATTERN,
        DEFAULT_LEGACY_ENDPOINT, DEFAULT_POLL_INTERVAL, DEFAULT_STANDARD_ENDPOINT,
        ENDPOINT_PLACEHOLDER, LOGIN_PLACEHOLDER, PASSWORD_PLACEHOLDER,
    },
    credentials::Credentials,
    error::DialupError,
    interfaces::Classifier,
    process::{CommandSpec, Role},
    runtime,
};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(login|password|endpoint)\}").expect("placeholder pattern is a valid regex")
});

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// How often the interface list is polled (e.g. "1s", "500ms").
    pub poll_interval: String,
    /// Pattern an interface name must match at its start to count as online.
    pub interface_pattern: String,
    /// Override for the credentials file location.
    pub credentials_path: Option<PathBuf>,
    /// Override for the dial log location.
    pub log_file: Option<PathBuf>,
    /// Provider names selected by the credentials' endpoint flag.
    pub endpoints: EndpointConfig,
    /// Program that brings the link up.
    pub connect: ToolConfig,
    /// Program that tears the link down.
    pub disconnect: ToolConfig,
}

/// Provider names for the two endpoints.
#[derive(Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfig {
    pub legacy: String,
    pub standard: String,
}

/// An external dial-up control program and its argument template.
///
/// `{login}`, `{password}` and `{endpoint}` are substituted in every argument.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: format!("{}ms", DEFAULT_POLL_INTERVAL.as_millis()),
            interface_pattern: DEFAULT_INTERFACE_PATTERN.to_string(),
            credentials_path: None,
            log_file: None,
            endpoints: EndpointConfig::default(),
            connect: ToolConfig::from_defaults(DEFAULT_CONNECT_COMMAND, DEFAULT_CONNECT_ARGS),
            disconnect: ToolConfig::from_defaults(
                DEFAULT_DISCONNECT_COMMAND,
                DEFAULT_DISCONNECT_ARGS,
            ),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            legacy: DEFAULT_LEGACY_ENDPOINT.to_string(),
            standard: DEFAULT_STANDARD_ENDPOINT.to_string(),
        }
    }
}

impl ToolConfig {
    fn from_defaults(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

impl Config {
    /// Parsed poll interval.
    pub fn poll_interval(&self) -> Result<Duration, DialupError> {
        let interval = parse_duration(&self.poll_interval)?;
        if interval.is_zero() {
            return Err(DialupError::ConfigInvalid(
                "poll_interval must be greater than zero".into(),
            ));
        }
        Ok(interval)
    }

    pub fn classifier(&self) -> Result<Classifier, DialupError> {
        Classifier::new(&self.interface_pattern)
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.credentials_path
            .clone()
            .unwrap_or_else(runtime::credentials_path)
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_file.clone().unwrap_or_else(runtime::dial_log_path)
    }

    pub fn tool(&self, role: Role) -> &ToolConfig {
        match role {
            Role::Connect => &self.connect,
            Role::Disconnect => &self.disconnect,
        }
    }

    /// Provider name selected by the credentials.
    pub fn endpoint_for(&self, credentials: &Credentials) -> &str {
        if credentials.legacy_endpoint {
            &self.endpoints.legacy
        } else {
            &self.endpoints.standard
        }
    }

    /// Builds the command line for `role` with the credentials substituted.
    ///
    /// Placeholders are replaced in a single pass, so substituted values are
    /// never scanned for further placeholders.
    pub fn command_for(&self, role: Role, credentials: &Credentials) -> CommandSpec {
        let tool = self.tool(role);
        let endpoint = self.endpoint_for(credentials);
        let args = tool
            .args
            .iter()
            .map(|arg| {
                PLACEHOLDER
                    .replace_all(arg, |caps: &regex::Captures<'_>| {
                        let value = match &caps[0] {
                            LOGIN_PLACEHOLDER => credentials.login.as_str(),
                            PASSWORD_PLACEHOLDER => credentials.password.as_str(),
                            ENDPOINT_PLACEHOLDER => endpoint,
                            _ => "",
                        };
                        value.to_string()
                    })
                    .into_owned()
            })
            .collect();
        CommandSpec::new(tool.command.clone(), args).with_secret(credentials.password.clone())
    }

    /// Checks every derived value so errors surface at load time.
    pub fn validate(&self) -> Result<(), DialupError> {
        self.poll_interval()?;
        self.classifier()?;
        for role in [Role::Connect, Role::Disconnect] {
            if self.tool(role).command.trim().is_empty() {
                return Err(DialupError::ConfigInvalid(format!(
                    "{role} command cannot be empty"
                )));
            }
        }
        Ok(())
    }
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
pub fn parse_duration(raw: &str) -> Result<Duration, DialupError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(DialupError::ConfigInvalid(
            "Duration value cannot be empty".into(),
        ));
    }

    let (amount_str, millis) = if let Some(stripped) = value.strip_suffix("ms") {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1_000)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60_000)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3_600_000)
    } else {
        (value, 1_000)
    };

    let amount: u64 = amount_str
        .parse()
        .map_err(|_| DialupError::ConfigInvalid(format!("Invalid duration value: '{raw}'")))?;

    Ok(Duration::from_millis(amount.saturating_mul(millis)))
}

/// Expands `$VAR` and `${VAR}` references within a string.
fn expand_env_vars(input: &str) -> Result<String, DialupError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").map_err(|err| {
        DialupError::ConfigInvalid(format!("environment pattern failed to compile: {err}"))
    })?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    match missing {
        Some(var_name) => Err(DialupError::ConfigInvalid(format!(
            "Missing environment variable: {var_name}"
        ))),
        None => Ok(result.into_owned()),
    }
}

/// Resolves which configuration file to read when none is given explicitly.
fn default_config_path() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }
    let user = runtime::config_dir().join(CONFIG_FILE_NAME);
    user.exists().then_some(user)
}

/// Loads and validates the configuration file, expanding environment variables.
///
/// An explicit path must be readable. Without one, `dialup.yaml` in the working
/// directory or `~/.config/dialup/dialup.yaml` is used, falling back to
/// built-in defaults when neither exists.
pub fn load_config(config_path: Option<&str>) -> Result<Config, DialupError> {
    let config_path = match config_path {
        Some(path) => PathBuf::from(path),
        None => match default_config_path() {
            Some(path) => path,
            None => return Ok(Config::default()),
        },
    };

    let content = read_config(&config_path)?;
    let expanded = expand_env_vars(&content)?;
    let config: Config = if expanded.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(&expanded).map_err(DialupError::ConfigParseError)?
    };

    config.validate()?;
    Ok(config)
}

fn read_config(path: &Path) -> Result<String, DialupError> {
    fs::read_to_string(path).map_err(|e| {
        DialupError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, path.display()),
        ))
    })
}
