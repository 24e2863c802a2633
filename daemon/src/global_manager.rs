use rmpv::Value;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;
use sysinfo::System;
use tracing::{error, warn};

use crate::application::SupervisionPolicy;
use crate::bus::Bus;
use crate::logging::LogLevel;
use crate::process;
use crate::property::{
    expect_bool, expect_in_range, expect_int, expect_string, expect_string_list, string_list, PropertyError,
    GROUP_GLOBAL,
};

pub const PROP_ROLE: &str = "role";
pub const PROP_HOST_LOG_LEVEL: &str = "hostLogLevel";
pub const PROP_REMOTE_LOG_LEVEL: &str = "remoteLogLevel";
pub const PROP_TERMINATE_TIMEOUT: &str = "terminateTimeout";
// Misspelt on the wire; clients depend on it.
pub const PROP_HEARTBEAT_TIMEOUT: &str = "heatbeatTimeout";
pub const PROP_CRASH_PERIOD: &str = "crashPeriod";
pub const PROP_CRASH_COUNT: &str = "crashCount";
pub const PROP_HTTP_ENABLED: &str = "httpEnabled";
pub const PROP_HTTP_PORT: &str = "httpPort";
pub const PROP_BACKEND_SERVER: &str = "backendServer";
pub const PROP_ALERT_MEMORY: &str = "alertMemory";
pub const PROP_MIN_MEMORY: &str = "minMemory";
pub const PROP_ALERT_DISK: &str = "alertDisk";
pub const PROP_MIN_DISK: &str = "minDisk";
pub const PROP_ALERT_DISK_LIST: &str = "alertDiskList";

/// Agent-wide settings, addressed as item `""` of group `glo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalSettings {
    pub role: String,
    pub host_log_level: String,
    pub remote_log_level: String,
    pub terminate_timeout: i64,
    #[serde(rename = "heatbeatTimeout")]
    pub heartbeat_timeout: i64,
    pub crash_period: i64,
    pub crash_count: i64,
    pub http_enabled: bool,
    pub http_port: i64,
    pub backend_server: String,
    pub alert_memory: bool,
    pub min_memory: i64,
    pub alert_disk: bool,
    pub min_disk: i64,
    pub alert_disk_list: Vec<String>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            role: String::new(),
            host_log_level: LogLevel::Normal.name().to_string(),
            remote_log_level: LogLevel::Normal.name().to_string(),
            terminate_timeout: 200,
            heartbeat_timeout: 5000,
            crash_period: 60,
            crash_count: 10,
            http_enabled: false,
            http_port: 8090,
            backend_server: String::new(),
            alert_memory: false,
            min_memory: 0,
            alert_disk: false,
            min_disk: 0,
            alert_disk_list: Vec::new(),
        }
    }
}

impl GlobalSettings {
    pub fn policy(&self) -> SupervisionPolicy {
        SupervisionPolicy {
            role: self.role.clone(),
            http_port: self
                .http_enabled
                .then(|| u16::try_from(self.http_port).ok())
                .flatten(),
            terminate_timeout: Duration::from_millis(self.terminate_timeout.max(0) as u64),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout.max(0) as u64),
            crash_period: Duration::from_secs(self.crash_period.max(0) as u64),
            crash_count: self.crash_count.max(0) as usize,
        }
    }

    pub fn host_log_level(&self) -> LogLevel {
        LogLevel::parse(&self.host_log_level).unwrap_or(LogLevel::Normal)
    }

    pub fn remote_log_level(&self) -> LogLevel {
        LogLevel::parse(&self.remote_log_level).unwrap_or(LogLevel::Normal)
    }
}

pub struct GlobalManager {
    settings: GlobalSettings,
    bus: Bus,
}

fn log_level(property: &str, value: &Value) -> Result<String, PropertyError> {
    let level = expect_string(property, value)?;
    if LogLevel::parse(&level).is_none() {
        return Err(PropertyError::InvalidValue {
            property: property.to_string(),
            reason: format!("'{level}' is not a log level"),
        });
    }
    Ok(level)
}

fn ranged(property: &str, value: &Value, min: i64, max: i64) -> Result<i64, PropertyError> {
    expect_in_range(property, expect_int(property, value)?, min, max)
}

impl GlobalManager {
    pub fn new(settings: GlobalSettings, bus: Bus) -> Self {
        Self { settings, bus }
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    pub fn get(&self, item: &str, property: &str) -> Result<Value, PropertyError> {
        if !item.is_empty() {
            return Err(PropertyError::UnknownItem(item.to_string()));
        }
        let s = &self.settings;
        Ok(match property {
            PROP_ROLE => Value::from(s.role.as_str()),
            PROP_HOST_LOG_LEVEL => Value::from(s.host_log_level.as_str()),
            PROP_REMOTE_LOG_LEVEL => Value::from(s.remote_log_level.as_str()),
            PROP_TERMINATE_TIMEOUT => Value::from(s.terminate_timeout),
            PROP_HEARTBEAT_TIMEOUT => Value::from(s.heartbeat_timeout),
            PROP_CRASH_PERIOD => Value::from(s.crash_period),
            PROP_CRASH_COUNT => Value::from(s.crash_count),
            PROP_HTTP_ENABLED => Value::from(s.http_enabled),
            PROP_HTTP_PORT => Value::from(s.http_port),
            PROP_BACKEND_SERVER => Value::from(s.backend_server.as_str()),
            PROP_ALERT_MEMORY => Value::from(s.alert_memory),
            PROP_MIN_MEMORY => Value::from(s.min_memory),
            PROP_ALERT_DISK => Value::from(s.alert_disk),
            PROP_MIN_DISK => Value::from(s.min_disk),
            PROP_ALERT_DISK_LIST => string_list(s.alert_disk_list.iter().cloned()),
            _ => return Err(PropertyError::UnknownProperty(property.to_string())),
        })
    }

    /// Validates and applies one property; out-of-range values are rejected.
    pub fn set(&mut self, item: &str, property: &str, value: &Value) -> Result<(), PropertyError> {
        if !item.is_empty() {
            return Err(PropertyError::UnknownItem(item.to_string()));
        }
        let before = self.get(item, property)?;
        let s = &mut self.settings;
        match property {
            PROP_ROLE => s.role = expect_string(property, value)?,
            PROP_HOST_LOG_LEVEL => s.host_log_level = log_level(property, value)?,
            PROP_REMOTE_LOG_LEVEL => s.remote_log_level = log_level(property, value)?,
            PROP_TERMINATE_TIMEOUT => s.terminate_timeout = ranged(property, value, 0, 120_000)?,
            PROP_HEARTBEAT_TIMEOUT => s.heartbeat_timeout = ranged(property, value, 100, 99_999)?,
            PROP_CRASH_PERIOD => s.crash_period = ranged(property, value, 5, 99_999)?,
            PROP_CRASH_COUNT => s.crash_count = ranged(property, value, 2, 99)?,
            PROP_HTTP_ENABLED => s.http_enabled = expect_bool(property, value)?,
            PROP_HTTP_PORT => s.http_port = ranged(property, value, 1, 65_535)?,
            PROP_BACKEND_SERVER => s.backend_server = expect_string(property, value)?.trim().to_string(),
            PROP_ALERT_MEMORY => s.alert_memory = expect_bool(property, value)?,
            PROP_MIN_MEMORY => s.min_memory = ranged(property, value, 0, i64::MAX)?,
            PROP_ALERT_DISK => s.alert_disk = expect_bool(property, value)?,
            PROP_MIN_DISK => s.min_disk = ranged(property, value, 0, i64::MAX)?,
            PROP_ALERT_DISK_LIST => s.alert_disk_list = expect_string_list(property, value)?,
            _ => return Err(PropertyError::UnknownProperty(property.to_string())),
        }
        let after = self.get(item, property)?;
        if after != before {
            self.bus.value(GROUP_GLOBAL, item, property, after);
        }
        Ok(())
    }

    /// Replaces every setting, announcing each property that changed.
    pub fn apply_settings(&mut self, settings: GlobalSettings) {
        let props = [
            PROP_ROLE,
            PROP_HOST_LOG_LEVEL,
            PROP_REMOTE_LOG_LEVEL,
            PROP_TERMINATE_TIMEOUT,
            PROP_HEARTBEAT_TIMEOUT,
            PROP_CRASH_PERIOD,
            PROP_CRASH_COUNT,
            PROP_HTTP_ENABLED,
            PROP_HTTP_PORT,
            PROP_BACKEND_SERVER,
            PROP_ALERT_MEMORY,
            PROP_MIN_MEMORY,
            PROP_ALERT_DISK,
            PROP_MIN_DISK,
            PROP_ALERT_DISK_LIST,
        ];
        let before: Vec<Option<Value>> = props.iter().map(|p| self.get("", p).ok()).collect();
        self.settings = settings;
        for (prop, old) in props.into_iter().zip(before) {
            if let Ok(now) = self.get("", prop) {
                if Some(&now) != old.as_ref() {
                    self.bus.value(GROUP_GLOBAL, "", prop, now);
                }
            }
        }
    }
}

// ── System report ─────────────────────────────────────────────────────────────

pub fn host_name() -> String {
    System::host_name().unwrap_or_else(|| "localhost".to_string())
}

/// Powers the host off or reboots it through the platform `shutdown` command.
pub fn power_off(reboot: bool) -> bool {
    let mode = if reboot { "-r" } else { "-h" };
    let args = [mode.to_string(), "now".to_string()];
    warn!("host {} requested", if reboot { "reboot" } else { "shutdown" });
    match process::spawn_detached(Path::new("shutdown"), &args, None, None) {
        Ok(()) => true,
        Err(e) => {
            error!("{e:#}");
            false
        }
    }
}

/// Human-readable host summary returned by the `sysinfo` command.
pub fn sysinfo_report(data_dir: &Path) -> String {
    let mut sys = System::new();
    sys.refresh_memory();

    let mut out = String::new();
    let unknown = || "unknown".to_string();
    let _ = writeln!(out, "Host name: {}", host_name());
    let _ = writeln!(out, "Agent version: {}", env!("CARGO_PKG_VERSION"));
    let _ = writeln!(out, "Data directory: {}", data_dir.display());
    let _ = writeln!(out, "Uptime: {}", format_uptime(System::uptime()));
    let _ = writeln!(
        out,
        "OS: {} {}",
        System::name().unwrap_or_else(unknown),
        System::os_version().unwrap_or_else(unknown)
    );
    let _ = writeln!(out, "Kernel: {}", System::kernel_version().unwrap_or_else(unknown));
    let _ = writeln!(out, "CPU architecture: {}", std::env::consts::ARCH);
    let _ = writeln!(
        out,
        "Memory: {} MiB free of {} MiB",
        sys.available_memory() / (1024 * 1024),
        sys.total_memory() / (1024 * 1024)
    );
    out
}

fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    format!("{days}d {hours}h {minutes}m")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{drain, Signal};

    fn manager() -> (GlobalManager, tokio::sync::mpsc::UnboundedReceiver<Signal>) {
        let (bus, rx) = Bus::new();
        (GlobalManager::new(GlobalSettings::default(), bus), rx)
    }

    #[test]
    fn defaults_match_wire_defaults() {
        let (m, _rx) = manager();
        assert_eq!(m.get("", PROP_TERMINATE_TIMEOUT).unwrap(), Value::from(200));
        assert_eq!(m.get("", PROP_HEARTBEAT_TIMEOUT).unwrap(), Value::from(5000));
        assert_eq!(m.get("", PROP_CRASH_COUNT).unwrap(), Value::from(10));
        assert_eq!(m.get("", PROP_HTTP_PORT).unwrap(), Value::from(8090));
    }

    #[test]
    fn ranges_are_enforced() {
        let (mut m, _rx) = manager();
        assert!(m.set("", PROP_CRASH_COUNT, &Value::from(1)).is_err());
        assert!(m.set("", PROP_CRASH_COUNT, &Value::from(100)).is_err());
        m.set("", PROP_CRASH_COUNT, &Value::from(2)).unwrap();
        assert!(m.set("", PROP_HEARTBEAT_TIMEOUT, &Value::from(99)).is_err());
        assert!(m.set("", PROP_TERMINATE_TIMEOUT, &Value::from(120_001)).is_err());
        assert!(m.set("", PROP_CRASH_PERIOD, &Value::from(4)).is_err());
        assert_eq!(m.get("", PROP_CRASH_COUNT).unwrap(), Value::from(2));
    }

    #[test]
    fn log_levels_are_validated() {
        let (mut m, _rx) = manager();
        assert!(m.set("", PROP_HOST_LOG_LEVEL, &Value::from("verbose")).is_err());
        m.set("", PROP_HOST_LOG_LEVEL, &Value::from("debug")).unwrap();
        assert_eq!(m.settings().host_log_level(), LogLevel::Debug);
    }

    #[test]
    fn set_emits_only_on_change() {
        let (mut m, mut rx) = manager();
        m.set("", PROP_ROLE, &Value::from("kiosk")).unwrap();
        m.set("", PROP_ROLE, &Value::from("kiosk")).unwrap();
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn non_empty_item_is_unknown() {
        let (m, _rx) = manager();
        assert_eq!(
            m.get("x", PROP_ROLE),
            Err(PropertyError::UnknownItem("x".to_string()))
        );
    }

    #[test]
    fn policy_reflects_settings() {
        let settings = GlobalSettings {
            http_enabled: true,
            crash_count: 3,
            ..GlobalSettings::default()
        };
        let policy = settings.policy();
        assert_eq!(policy.http_port, Some(8090));
        assert_eq!(policy.crash_count, 3);
        assert_eq!(policy.terminate_timeout, Duration::from_millis(200));
        assert_eq!(GlobalSettings::default().policy().http_port, None);
    }

    #[test]
    fn apply_settings_announces_changed_properties() {
        let (mut m, mut rx) = manager();
        m.apply_settings(GlobalSettings {
            role: "wall".to_string(),
            ..GlobalSettings::default()
        });
        let got = drain(&mut rx);
        assert_eq!(got.len(), 1);
        assert!(matches!(&got[0], Signal::Value(c) if c.property == PROP_ROLE));
    }

    #[test]
    fn sysinfo_report_mentions_data_dir() {
        let report = sysinfo_report(Path::new("/var/lib/pinhole"));
        assert!(report.contains("Data directory: /var/lib/pinhole"));
        assert!(report.contains("Agent version:"));
        assert_eq!(format_uptime(90_061), "1d 1h 1m");
    }
}
