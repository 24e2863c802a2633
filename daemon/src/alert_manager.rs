use chrono::{DateTime, Local};
use rmpv::Value;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, error, warn};

use crate::bus::Bus;
use crate::paths;
use crate::property::{
    expect_bool, expect_string, string_list, validate_name, ManagerError, PropertyError, GROUP_ALERT, GROUP_NONE,
};

pub const PROP_ALERT_COUNT: &str = "alertCount";
pub const PROP_SLOT_LIST: &str = "alertSlotList";
pub const PROP_SLOT_NAME: &str = "alertSlotName";
pub const PROP_SLOT_ENABLED: &str = "alertSlotEnabled";
pub const PROP_SLOT_TYPE: &str = "alertSlotType";
pub const PROP_SLOT_ARG: &str = "alertSlotArg";

pub const SLOT_TYPES: [&str; 5] = ["smtpEmail", "httpGet", "httpPost", "slack", "external"];

const ALERT_LOG_HEADER: &str = "%Y-%m-%d %H:%M:%S %a";

/// A configured delivery target for alerts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertSlot {
    #[serde(rename = "alertSlotName")]
    pub name: String,
    #[serde(rename = "alertSlotEnabled")]
    pub enabled: bool,
    #[serde(rename = "alertSlotType")]
    pub slot_type: String,
    #[serde(rename = "alertSlotArg")]
    pub argument: String,
}

impl Default for AlertSlot {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: false,
            slot_type: SLOT_TYPES[0].to_string(),
            argument: String::new(),
        }
    }
}

impl AlertSlot {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

pub struct AlertManager {
    slots: Vec<AlertSlot>,
    count: i64,
    alerts: Vec<String>,
    log_path: PathBuf,
    bus: Bus,
}

impl AlertManager {
    pub fn new(data_dir: &std::path::Path, bus: Bus) -> Self {
        Self {
            slots: Vec::new(),
            count: 0,
            alerts: Vec::new(),
            log_path: paths::alert_log_path(data_dir),
            bus,
        }
    }

    pub fn load(&mut self, slots: Vec<AlertSlot>) {
        for slot in slots {
            if validate_name(&slot.name).is_ok() && self.find(&slot.name).is_none() {
                self.slots.push(slot);
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name.clone()).collect()
    }

    pub fn slots(&self) -> Vec<AlertSlot> {
        self.slots.clone()
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    fn find(&self, name: &str) -> Option<&AlertSlot> {
        self.slots.iter().find(|s| s.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut AlertSlot> {
        self.slots.iter_mut().find(|s| s.name == name)
    }

    fn announce_list(&self) {
        self.bus.value(GROUP_ALERT, GROUP_NONE, PROP_SLOT_LIST, string_list(self.names()));
    }

    // ── Registry ──────────────────────────────────────────────────────────────

    pub fn add_slot(&mut self, name: &str) -> Result<(), ManagerError> {
        validate_name(name)?;
        if self.find(name).is_some() {
            return Err(ManagerError::AlreadyExists(name.to_string()));
        }
        self.slots.push(AlertSlot::named(name));
        self.announce_list();
        Ok(())
    }

    pub fn delete_slot(&mut self, name: &str) -> Result<(), ManagerError> {
        let before = self.slots.len();
        self.slots.retain(|s| s.name != name);
        if self.slots.len() == before {
            return Err(ManagerError::NotFound(name.to_string()));
        }
        self.announce_list();
        Ok(())
    }

    pub fn rename_slot(&mut self, from: &str, to: &str) -> Result<(), ManagerError> {
        validate_name(to)?;
        if self.find(to).is_some() {
            return Err(ManagerError::AlreadyExists(to.to_string()));
        }
        let slot = self
            .find_mut(from)
            .ok_or_else(|| ManagerError::NotFound(from.to_string()))?;
        slot.name = to.to_string();
        self.announce_list();
        Ok(())
    }

    /// Merges an imported slot by name.
    pub fn upsert(&mut self, slot: AlertSlot) -> Result<(), ManagerError> {
        validate_name(&slot.name)?;
        match self.find_mut(&slot.name) {
            Some(existing) => {
                let changes = [
                    (PROP_SLOT_ENABLED, existing.enabled != slot.enabled, Value::from(slot.enabled)),
                    (PROP_SLOT_TYPE, existing.slot_type != slot.slot_type, Value::from(slot.slot_type.as_str())),
                    (PROP_SLOT_ARG, existing.argument != slot.argument, Value::from(slot.argument.as_str())),
                ];
                *existing = slot.clone();
                for (property, changed, value) in changes {
                    if changed {
                        self.bus.value(GROUP_ALERT, &slot.name, property, value);
                    }
                }
            }
            None => {
                self.slots.push(slot);
                self.announce_list();
            }
        }
        Ok(())
    }

    // ── Alerts ────────────────────────────────────────────────────────────────

    /// Records an alert: counter, in-memory list and the alert log file.
    /// Delivery to the configured slots is not performed by the agent.
    pub fn generate_alert(&mut self, text: &str, now: DateTime<Local>) {
        warn!("ALERT: {text}");

        self.count += 1;
        let line = format!("{}: {text}", now.format(ALERT_LOG_HEADER));
        self.alerts.push(line.clone());
        self.bus.value(GROUP_ALERT, GROUP_NONE, PROP_ALERT_COUNT, self.count);

        if let Err(e) = self.append_to_log(&line) {
            error!("failed to write alert log {}: {e}", self.log_path.display());
        }

        for slot in self.slots.iter().filter(|s| s.enabled) {
            debug!("alert slot '{}' ({}) would deliver: {text}", slot.name, slot.slot_type);
        }
    }

    fn append_to_log(&self, line: &str) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\r\n")
    }

    pub fn reset_alerts(&mut self) {
        self.alerts.clear();
        if self.count != 0 {
            self.count = 0;
            self.bus.value(GROUP_ALERT, GROUP_NONE, PROP_ALERT_COUNT, 0);
        }
    }

    pub fn alert_list(&self) -> String {
        if self.alerts.is_empty() {
            return "(No alerts logged)".to_string();
        }
        self.alerts.join("\n")
    }

    // ── Properties ────────────────────────────────────────────────────────────

    pub fn get(&self, item: &str, property: &str) -> Result<Value, PropertyError> {
        if item.is_empty() {
            return match property {
                PROP_ALERT_COUNT => Ok(Value::from(self.count)),
                PROP_SLOT_LIST => Ok(string_list(self.names())),
                _ => Err(PropertyError::UnknownProperty(property.to_string())),
            };
        }
        let slot = self
            .find(item)
            .ok_or_else(|| PropertyError::UnknownItem(item.to_string()))?;
        match property {
            PROP_SLOT_NAME => Ok(Value::from(slot.name.as_str())),
            PROP_SLOT_ENABLED => Ok(Value::from(slot.enabled)),
            PROP_SLOT_TYPE => Ok(Value::from(slot.slot_type.as_str())),
            PROP_SLOT_ARG => Ok(Value::from(slot.argument.as_str())),
            _ => Err(PropertyError::UnknownProperty(property.to_string())),
        }
    }

    pub fn set(&mut self, item: &str, property: &str, value: &Value) -> Result<(), PropertyError> {
        if item.is_empty() {
            return match property {
                PROP_ALERT_COUNT | PROP_SLOT_LIST => Err(PropertyError::ReadOnly(property.to_string())),
                _ => Err(PropertyError::UnknownProperty(property.to_string())),
            };
        }
        let slot = self
            .find_mut(item)
            .ok_or_else(|| PropertyError::UnknownItem(item.to_string()))?;
        let changed = match property {
            PROP_SLOT_NAME => return Err(PropertyError::ReadOnly(property.to_string())),
            PROP_SLOT_ENABLED => {
                let enabled = expect_bool(property, value)?;
                std::mem::replace(&mut slot.enabled, enabled) != enabled
            }
            PROP_SLOT_TYPE => {
                let slot_type = expect_string(property, value)?;
                if !SLOT_TYPES.contains(&slot_type.as_str()) {
                    return Err(PropertyError::InvalidValue {
                        property: property.to_string(),
                        reason: format!("unknown alert slot type '{slot_type}'"),
                    });
                }
                let changed = slot.slot_type != slot_type;
                slot.slot_type = slot_type;
                changed
            }
            PROP_SLOT_ARG => {
                let argument = expect_string(property, value)?;
                let changed = slot.argument != argument;
                slot.argument = argument;
                changed
            }
            _ => return Err(PropertyError::UnknownProperty(property.to_string())),
        };
        if changed {
            self.bus.value(GROUP_ALERT, item, property, value.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{drain, Signal};
    use chrono::TimeZone;

    fn manager(dir: &std::path::Path) -> (AlertManager, tokio::sync::mpsc::UnboundedReceiver<Signal>) {
        let (bus, rx) = Bus::new();
        (AlertManager::new(dir, bus), rx)
    }

    // ── alerts ────────────────────────────────────────────────────────────────

    #[test]
    fn generate_alert_counts_lists_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let (mut m, mut rx) = manager(dir.path());
        let now = Local.with_ymd_and_hms(2024, 3, 4, 9, 15, 0).unwrap();

        m.generate_alert("disk full", now);
        m.generate_alert("app crashed", now);

        assert_eq!(m.count(), 2);
        assert_eq!(m.get("", PROP_ALERT_COUNT).unwrap(), Value::from(2));
        let signals = drain(&mut rx);
        assert_eq!(signals.len(), 2);
        assert!(matches!(&signals[1], Signal::Value(c) if c.value == Value::from(2)));

        let log = std::fs::read_to_string(paths::alert_log_path(dir.path())).unwrap();
        assert_eq!(
            log,
            "2024-03-04 09:15:00 Mon: disk full\r\n2024-03-04 09:15:00 Mon: app crashed\r\n"
        );
        assert_eq!(
            m.alert_list(),
            "2024-03-04 09:15:00 Mon: disk full\n2024-03-04 09:15:00 Mon: app crashed"
        );
    }

    #[test]
    fn reset_clears_count_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let (mut m, _rx) = manager(dir.path());
        m.generate_alert("x", Local::now());
        m.reset_alerts();
        assert_eq!(m.count(), 0);
        assert_eq!(m.alert_list(), "(No alerts logged)");
        // The file log survives a reset.
        assert!(paths::alert_log_path(dir.path()).exists());
    }

    // ── slots ─────────────────────────────────────────────────────────────────

    #[test]
    fn slot_registry_and_properties() {
        let dir = tempfile::tempdir().unwrap();
        let (mut m, _rx) = manager(dir.path());
        m.add_slot("ops").unwrap();
        assert_eq!(m.add_slot("ops"), Err(ManagerError::AlreadyExists("ops".to_string())));

        m.set("ops", PROP_SLOT_TYPE, &Value::from("slack")).unwrap();
        assert!(matches!(
            m.set("ops", PROP_SLOT_TYPE, &Value::from("pager")),
            Err(PropertyError::InvalidValue { .. })
        ));
        m.set("ops", PROP_SLOT_ENABLED, &Value::from(true)).unwrap();
        assert_eq!(
            m.set("", PROP_ALERT_COUNT, &Value::from(0)),
            Err(PropertyError::ReadOnly(PROP_ALERT_COUNT.to_string()))
        );

        m.rename_slot("ops", "oncall").unwrap();
        assert_eq!(m.get("oncall", PROP_SLOT_TYPE).unwrap(), Value::from("slack"));
        assert_eq!(m.get("", PROP_SLOT_LIST).unwrap(), string_list(["oncall"]));
        m.delete_slot("oncall").unwrap();
        assert!(m.names().is_empty());
    }

    #[test]
    fn upsert_merges_existing_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (mut m, mut rx) = manager(dir.path());
        m.add_slot("ops").unwrap();
        drain(&mut rx);

        let mut slot = AlertSlot::named("ops");
        slot.argument = "ops@example.com".to_string();
        m.upsert(slot).unwrap();
        assert_eq!(m.get("ops", PROP_SLOT_ARG).unwrap(), Value::from("ops@example.com"));
        assert_eq!(drain(&mut rx).len(), 1);
    }
}
