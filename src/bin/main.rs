use nix::{errno::Errno, sys::signal, unistd::Pid};
use std::{
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dialup::{
    cli::{Cli, Commands, CredentialArgs, parse_args},
    config::{Config, load_config},
    credentials::{CredentialChange, CredentialStore},
    interfaces::{self, SystemInterfaces},
    ipc::{self, ControlCommand, ControlError, ControlResponse},
    logs::{ConsoleSink, FileSink, TeeSink},
    supervisor::{Affordances, StatusReport, Supervisor},
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Run { config, connect } => {
            if supervisor_running() {
                warn!("dialup supervisor already running; aborting duplicate start");
                return Ok(());
            }
            let config = load_config(config.as_deref())?;
            run_supervisor(config, connect)?;
        }
        Commands::Connect { credentials } => {
            if !credentials.is_empty() {
                send_control_command(set_credentials_command(credentials))?;
            }
            send_control_command(ControlCommand::Connect)?;
        }
        Commands::Disconnect => {
            send_control_command(ControlCommand::Disconnect)?;
        }
        Commands::Status { config, json } => {
            let report = if supervisor_running() {
                match send_control_command(ControlCommand::Status)? {
                    Some(ControlResponse::Status(report)) => report,
                    _ => local_status(&load_config(config.as_deref())?),
                }
            } else {
                local_status(&load_config(config.as_deref())?)
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", ipc::format_status(&report));
            }
        }
        Commands::Interfaces { config } => {
            let config = load_config(config.as_deref())?;
            let classifier = config.classifier()?;
            let names = interfaces::list_interfaces();
            for name in &names {
                let marker = if classifier.classify(std::slice::from_ref(name))
                    == interfaces::ConnectionStatus::Online
                {
                    "  (dial-up link)"
                } else {
                    ""
                };
                println!("{name}{marker}");
            }
            println!("Connection: {}", classifier.classify(&names).label());
        }
        Commands::SetCredentials {
            config,
            credentials,
        } => {
            if credentials.is_empty() {
                warn!("No credential fields given; nothing to update");
                return Ok(());
            }
            if supervisor_running() {
                send_control_command(set_credentials_command(credentials))?;
            } else {
                let config = load_config(config.as_deref())?;
                let mut store = CredentialStore::load(config.credentials_path());
                let changed = credential_changes(credentials)
                    .into_iter()
                    .filter(|change| store.apply(change.clone()))
                    .count();
                store.flush()?;
                println!("Updated {changed} credential field(s)");
            }
        }
        Commands::Shutdown => {
            send_control_command(ControlCommand::Shutdown)?;
        }
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_supervisor(config: Config, connect: bool) -> Result<(), Box<dyn Error>> {
    let mut sink = TeeSink::new().with(ConsoleSink);
    match FileSink::open(config.log_file()) {
        Ok(file) => {
            info!("Appending dial log to {:?}", file.path());
            sink = sink.with(file);
        }
        Err(err) => warn!("Dial log unavailable, using console only: {err}"),
    }

    let shutdown = register_signal_handler()?;
    let mut supervisor = Supervisor::new(config, SystemInterfaces, sink)?;
    supervisor.bind_control()?;

    if connect && let Err(err) = supervisor.connect_saved() {
        error!("Initial connect failed: {err}");
    }

    supervisor.run(&shutdown)?;
    Ok(())
}

fn register_signal_handler() -> Result<Arc<AtomicBool>, Box<dyn Error>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("dialup is shutting down...");
        flag.store(true, Ordering::SeqCst);
    })?;
    Ok(shutdown)
}

fn supervisor_running() -> bool {
    match ipc::read_supervisor_pid() {
        Ok(Some(pid)) => match signal::kill(Pid::from_raw(pid), None) {
            Ok(_) => true,
            Err(Errno::ESRCH) => {
                let _ = ipc::cleanup_runtime();
                false
            }
            Err(err) => {
                warn!("Failed to query supervisor pid {pid}: {err}");
                false
            }
        },
        Ok(None) | Err(_) => false,
    }
}

fn send_control_command(
    command: ControlCommand,
) -> Result<Option<ControlResponse>, Box<dyn Error>> {
    match ipc::send_command(&command) {
        Ok(ControlResponse::Message(message)) => {
            println!("{message}");
            Ok(None)
        }
        Ok(ControlResponse::Ok) => Ok(None),
        Ok(ControlResponse::Error(message)) => Err(ControlError::Server(message).into()),
        Ok(response) => Ok(Some(response)),
        Err(ControlError::NotAvailable) => {
            warn!("No running dialup supervisor found; start one with `dialup run`");
            let _ = ipc::cleanup_runtime();
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

fn credential_changes(args: CredentialArgs) -> Vec<CredentialChange> {
    let CredentialArgs {
        login,
        password,
        legacy,
    } = args;
    login
        .map(CredentialChange::Login)
        .into_iter()
        .chain(password.map(CredentialChange::Password))
        .chain(legacy.map(CredentialChange::LegacyEndpoint))
        .collect()
}

fn set_credentials_command(args: CredentialArgs) -> ControlCommand {
    ControlCommand::SetCredentials {
        login: args.login,
        password: args.password,
        legacy_endpoint: args.legacy,
    }
}

/// Status computed in-process when no supervisor is resident.
fn local_status(config: &Config) -> StatusReport {
    let status = match config.classifier() {
        Ok(classifier) => classifier.classify(&interfaces::list_interfaces()),
        Err(_) => interfaces::classify(&interfaces::list_interfaces()),
    };
    let store = CredentialStore::load(config.credentials_path());
    let credentials = store.credentials();
    StatusReport {
        status,
        affordances: Affordances::for_status(status),
        login: credentials.login.clone(),
        endpoint: config.endpoint_for(credentials).to_string(),
        connect_pid: None,
        disconnect_pid: None,
    }
}
