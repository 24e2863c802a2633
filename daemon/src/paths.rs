//! Canonical file paths for Pinhole agent data files.
//!
//! Everything lives under one data directory (default `~/.local/share/pinhole/`,
//! overridden by `$PINHOLE_DATA` or `--data-dir`):
//!   - pinhole.toml        Bootstrap configuration, watched for changes.
//!   - settings.toml       Persisted applications, groups, events and globals.
//!   - host.pem/host.key   TLS certificate and private key.
//!   - local.secret        One-time shared secret for same-host companions.
//!   - pinholealerts.txt   Append-only alert history.
//!   - appoutput/          Captured application console output.
//!   - logs/               Daily rolling agent log files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const APP_DIR_NAME: &str = "pinhole";
pub const CONFIG_FILE_NAME: &str = "pinhole.toml";
pub const SETTINGS_FILE_NAME: &str = "settings.toml";
pub const CERT_FILE_NAME: &str = "host.pem";
pub const KEY_FILE_NAME: &str = "host.key";
pub const SECRET_FILE_NAME: &str = "local.secret";
pub const ALERT_LOG_FILE_NAME: &str = "pinholealerts.txt";
pub const APP_OUTPUT_DIR_NAME: &str = "appoutput";
pub const LOG_DIR_NAME: &str = "logs";
/// Base name of the daily log files; the appender adds a `.YYYY-MM-DD` suffix.
pub const LOG_FILE_NAME: &str = "pinholelog.txt";
/// Timestamp embedded in generated file names.
pub const FILE_DATETIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Returns the agent data directory: `$PINHOLE_DATA` if set, otherwise
/// `$HOME/.local/share/pinhole`.
pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("PINHOLE_DATA") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".local").join("share").join(APP_DIR_NAME))
}

pub fn config_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

pub fn settings_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SETTINGS_FILE_NAME)
}

pub fn cert_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CERT_FILE_NAME)
}

pub fn key_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(KEY_FILE_NAME)
}

pub fn secret_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SECRET_FILE_NAME)
}

pub fn alert_log_path(data_dir: &Path) -> PathBuf {
    data_dir.join(ALERT_LOG_FILE_NAME)
}

pub fn default_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

/// Console capture file for an application: `<data>/appoutput/<name>.output`
pub fn app_output_path(data_dir: &Path, app_name: &str) -> PathBuf {
    data_dir
        .join(APP_OUTPUT_DIR_NAME)
        .join(format!("{}.output", sanitize_file_name(app_name)))
}

/// `<data>/<prefix>-<timestamp>.png`, used for lockup and scheduled screenshots.
pub fn screenshot_path(data_dir: &Path, prefix: &str, now: &chrono::DateTime<chrono::Local>) -> PathBuf {
    data_dir.join(format!(
        "{}-{}.png",
        sanitize_file_name(prefix),
        now.format(FILE_DATETIME_FORMAT)
    ))
}

/// Named pipe the child writes log/alert/heartbeat lines into.
pub fn log_pipe_path(app_name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(".PINHOLE-{}-LOG.fifo", sanitize_file_name(app_name)))
}

/// Replaces characters that cannot appear in a single path component with `_`.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}
