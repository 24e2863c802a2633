mod agent;
mod alert_manager;
mod app_io;
mod app_manager;
mod application;
mod bus;
mod cert;
mod client;
mod commands;
mod config;
mod crash_counter;
mod dispatcher;
mod event;
mod global_manager;
mod group_manager;
mod logging;
mod multiplex;
mod paths;
mod process;
mod property;
mod protocol;
mod proxy_link;
mod resource_monitor;
mod schedule;
mod secret;
mod settings;
mod transport;
mod watchdog;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{error, info, warn};

use crate::agent::{Agent, AgentParts};
use crate::alert_manager::AlertManager;
use crate::app_manager::AppManager;
use crate::bus::Bus;
use crate::commands::Managers;
use crate::dispatcher::Dispatcher;
use crate::event::AgentEvent;
use crate::global_manager::GlobalManager;
use crate::group_manager::GroupManager;
use crate::logging::LogLevel;
use crate::schedule::ScheduleManager;
use crate::secret::{LocalSecret, PasswordHash};
use crate::watchdog::Watchdog;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Host supervisor agent: keeps applications running and serves remote consoles.
#[derive(Parser, Debug)]
#[command(name = "pinhole", version)]
struct Args {
    /// Data directory (default: $PINHOLE_DATA or ~/.local/share/pinhole).
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Bootstrap config file (default: <data-dir>/pinhole.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Clear the password of the agent running on this host, then exit.
    #[arg(long)]
    reset_password: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    // Another crate in the tree may already have picked a provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("pinhole: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    // ── Data directory ────────────────────────────────────────────────────────
    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => paths::default_data_dir()?,
    };
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = args.config.unwrap_or_else(|| paths::config_file_path(&data_dir));
    let config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        eprintln!("[config] Error (using defaults): {e:#}");
        config::Config::default()
    });

    // ── Logging ───────────────────────────────────────────────────────────────
    let log_dir = config
        .logging
        .log_dir
        .clone()
        .unwrap_or_else(|| paths::default_log_dir(&data_dir));
    let (logging, remote_logs) = logging::init(&config.logging.filter, &log_dir)?;

    if args.reset_password {
        return Ok(match client::reset_password(&data_dir, config.server.listen_port).await {
            Ok(()) => {
                info!("Password cleared");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Password reset failed: {e:#}");
                ExitCode::FAILURE
            }
        });
    }

    info!("pinhole v{} starting in {}", env!("CARGO_PKG_VERSION"), data_dir.display());

    // ── Persisted state and credentials ───────────────────────────────────────
    let settings_path = paths::settings_file_path(&data_dir);
    let persisted = settings::load_settings(&settings_path)?;
    let secret = LocalSecret::generate(&paths::secret_file_path(&data_dir))?;
    let host = global_manager::host_name();
    let material = cert::load_or_generate(
        &paths::cert_file_path(&data_dir),
        &paths::key_file_path(&data_dir),
        &host,
    )?;
    let acceptor = TlsAcceptor::from(cert::server_config(&material)?);
    let connector = TlsConnector::from(cert::client_config(&material)?);

    // ── Managers ──────────────────────────────────────────────────────────────
    let (events_tx, events) = mpsc::channel::<AgentEvent>(EVENT_CHANNEL_CAPACITY);
    let (bus, signals) = Bus::new();
    let mut managers = Managers {
        apps: AppManager::new(bus.clone(), data_dir.clone(), events_tx.clone()),
        groups: GroupManager::new(bus.clone()),
        globals: GlobalManager::new(persisted.global, bus.clone()),
        alerts: AlertManager::new(&data_dir, bus.clone()),
        schedule: ScheduleManager::new(&data_dir, bus),
        data_dir: data_dir.clone(),
        log_dir,
    };
    managers.apps.load(persisted.applications);
    managers.groups.load(persisted.groups);
    managers.schedule.load(persisted.events);
    managers.alerts.load(persisted.alert_slots);

    let host_level = managers.globals.settings().host_log_level();
    if host_level != LogLevel::Normal {
        logging.set_level(host_level);
    }

    let dispatcher = Dispatcher::new(
        PasswordHash::new(persisted.salt, persisted.hash),
        secret,
        persisted.server_id,
        host,
        config.server.deferred_timeout(),
    );

    // ── Background tasks ──────────────────────────────────────────────────────
    let listener = transport::bind(&config.server.listen_address, config.server.listen_port).await?;
    tokio::spawn(transport::run_listener(listener, acceptor, events_tx.clone()));
    tokio::spawn(config::watch_config(config_path, events_tx.clone()));
    spawn_shutdown_listener(events_tx.clone());

    let watchdog = match Watchdog::start_default() {
        Ok(watchdog) => Some(watchdog),
        Err(e) => {
            warn!("failed to start the watchdog thread: {e}");
            None
        }
    };

    // ── Event loop ────────────────────────────────────────────────────────────
    let mut agent = Agent::new(AgentParts {
        managers,
        dispatcher,
        logging: Some(logging),
        config,
        settings_path,
        connector,
        events_tx,
        events,
        signals,
        remote_logs,
        watchdog,
    });
    agent.start_startup();
    agent.run().await;

    info!("pinhole stopped");
    Ok(ExitCode::SUCCESS)
}

/// Turns Ctrl+C (and SIGTERM on unix) into a graceful shutdown.
fn spawn_shutdown_listener(tx: mpsc::Sender<AgentEvent>) {
    tokio::spawn(async move {
        wait_for_termination().await;
        let _ = tx.send(AgentEvent::Shutdown).await;
    });
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
