use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::event::AgentEvent;

/// TCP port the agent listens on for console and companion connections.
pub const HOST_TCP_PORT: u16 = 5457;
/// TCP port a backend proxy accepts agent links on.
pub const PROXY_TCP_PORT: u16 = 5458;
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_DEFERRED_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_AUTOSAVE_SECS: u64 = 600;
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Root bootstrap configuration. Deserialized from `<data>/pinhole.toml`.
///
/// Everything an operator edits remotely (applications, groups, events,
/// globals) lives in the persisted settings instead; this file only holds
/// what the agent needs before it can accept connections.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address the TLS listener binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Port used when dialing the backend proxy named by the `backendServer` global.
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
    /// How long a deferred command (e.g. a screenshot) may wait for its companion.
    #[serde(default = "default_deferred_timeout")]
    pub deferred_timeout_secs: u64,
    /// Interval between automatic settings saves.
    #[serde(default = "default_autosave")]
    pub autosave_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            listen_port: HOST_TCP_PORT,
            backend_port: PROXY_TCP_PORT,
            deferred_timeout_secs: DEFAULT_DEFERRED_TIMEOUT_SECS,
            autosave_secs: DEFAULT_AUTOSAVE_SECS,
        }
    }
}

impl ServerConfig {
    /// Never zero: a zero timeout would fail every deferred command instantly.
    pub fn deferred_timeout(&self) -> Duration {
        Duration::from_secs(self.deferred_timeout_secs.max(1))
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive applied to the console and file layers.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Directory for daily log files. Defaults to `<data>/logs`.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            log_dir: None,
        }
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Watches the parent directory of `path`. Whenever the config file is
/// created or modified, reloads it and sends a `ConfigReloaded` event.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<AgentEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!("failed to create config watcher: {e}");
            return;
        }
    };

    // Editors often save by writing a new file and renaming it over the old one.
    let watch_dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            warn!("config path {} has no parent directory", path.display());
            return;
        }
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        warn!("failed to watch config directory {}: {e}", watch_dir.display());
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    info!("config file changed, reloading");
                    if tx.send(AgentEvent::ConfigReloaded(config)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("failed to reload config: {e:#}"),
            }
        }
    }
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.to_string()
}

fn default_listen_port() -> u16 {
    HOST_TCP_PORT
}

fn default_backend_port() -> u16 {
    PROXY_TCP_PORT
}

fn default_deferred_timeout() -> u64 {
    DEFAULT_DEFERRED_TIMEOUT_SECS
}

fn default_autosave() -> u64 {
    DEFAULT_AUTOSAVE_SECS
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}
