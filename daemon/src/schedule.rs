//! Named scheduled events fired from the agent's one-minute tick.
//!
//! Matching is a pure function of (frequency, offset, wall clock) so a whole
//! week can be simulated minute by minute in tests. Firing an event only
//! queues `Signal`s; the agent carries them out against the other managers.

use chrono::{DateTime, Datelike, Local, Timelike};
use rmpv::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::app_io::split_list;
use crate::bus::{Bus, Signal};
use crate::paths;
use crate::property::{
    expect_int, expect_string, format_datetime, string_list, validate_name, ManagerError, PropertyError,
    GROUP_NONE, GROUP_SCHEDULE,
};

pub const PROP_SCHED_LIST: &str = "schedList";
pub const PROP_SCHED_NAME: &str = "schedName";
pub const PROP_SCHED_TYPE: &str = "schedType";
pub const PROP_FREQUENCY: &str = "frequency";
pub const PROP_SCHED_ARGS: &str = "schedArgs";
pub const PROP_OFFSET: &str = "offset";
pub const PROP_LAST_TRIGGERED: &str = "lastTriggered";

const MINUTES_PER_HOUR: i64 = 60;
const MINUTES_PER_DAY: i64 = 1_440;
const MINUTES_PER_WEEK: i64 = 10_080;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    #[default]
    StartApps,
    StopApps,
    RestartApps,
    StartGroup,
    StopGroup,
    Shutdown,
    Reboot,
    Screenshot,
    TriggerEvents,
    Alert,
}

impl EventType {
    pub const ALL: [EventType; 10] = [
        EventType::StartApps,
        EventType::StopApps,
        EventType::RestartApps,
        EventType::StartGroup,
        EventType::StopGroup,
        EventType::Shutdown,
        EventType::Reboot,
        EventType::Screenshot,
        EventType::TriggerEvents,
        EventType::Alert,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::StartApps => "startApps",
            EventType::StopApps => "stopApps",
            EventType::RestartApps => "restartApps",
            EventType::StartGroup => "startGroup",
            EventType::StopGroup => "stopGroup",
            EventType::Shutdown => "shutdown",
            EventType::Reboot => "reboot",
            EventType::Screenshot => "screenshot",
            EventType::TriggerEvents => "triggerEvents",
            EventType::Alert => "alert",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    #[default]
    Disabled,
    Weekly,
    Daily,
    Hourly,
    Once,
}

impl Frequency {
    pub const ALL: [Frequency; 5] = [
        Frequency::Disabled,
        Frequency::Weekly,
        Frequency::Daily,
        Frequency::Hourly,
        Frequency::Once,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Disabled => "disabled",
            Frequency::Weekly => "weekly",
            Frequency::Daily => "daily",
            Frequency::Hourly => "hourly",
            Frequency::Once => "once",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == s)
    }
}

/// True when an event with this frequency and offset is due in the minute
/// containing `now`.
///
/// Offsets are minutes: since Sunday 00:00 for weekly, since midnight for
/// daily, past the hour for hourly and since the Unix epoch for once.
pub fn should_fire(frequency: Frequency, offset: i64, now: &DateTime<Local>) -> bool {
    let minute = i64::from(now.minute());
    let hour = i64::from(now.hour());
    let weekday = i64::from(now.weekday().num_days_from_sunday());
    match frequency {
        Frequency::Disabled => false,
        Frequency::Once => now.timestamp().div_euclid(60) == offset,
        Frequency::Hourly => minute == offset.rem_euclid(MINUTES_PER_HOUR),
        Frequency::Daily => hour * MINUTES_PER_HOUR + minute == offset.rem_euclid(MINUTES_PER_DAY),
        Frequency::Weekly => {
            weekday * MINUTES_PER_DAY + hour * MINUTES_PER_HOUR + minute == offset.rem_euclid(MINUTES_PER_WEEK)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleEvent {
    #[serde(rename = "schedName")]
    pub name: String,
    #[serde(rename = "schedType")]
    pub event_type: EventType,
    pub frequency: Frequency,
    #[serde(rename = "schedArgs")]
    pub arguments: String,
    pub offset: i64,
    #[serde(rename = "lastTriggered", with = "crate::property::wire_datetime")]
    pub last_triggered: Option<DateTime<Local>>,
}

impl ScheduleEvent {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

pub struct ScheduleManager {
    events: Vec<ScheduleEvent>,
    data_dir: PathBuf,
    bus: Bus,
}

impl ScheduleManager {
    pub fn new(data_dir: &Path, bus: Bus) -> Self {
        Self {
            events: Vec::new(),
            data_dir: data_dir.to_path_buf(),
            bus,
        }
    }

    pub fn load(&mut self, events: Vec<ScheduleEvent>) {
        for event in events {
            if validate_name(&event.name).is_ok() && self.find(&event.name).is_none() {
                self.events.push(event);
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.events.iter().map(|e| e.name.clone()).collect()
    }

    pub fn events(&self) -> Vec<ScheduleEvent> {
        self.events.clone()
    }

    fn find(&self, name: &str) -> Option<&ScheduleEvent> {
        self.events.iter().find(|e| e.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut ScheduleEvent> {
        self.events.iter_mut().find(|e| e.name == name)
    }

    fn announce_list(&self) {
        self.bus.value(GROUP_SCHEDULE, GROUP_NONE, PROP_SCHED_LIST, string_list(self.names()));
    }

    // ── Registry ──────────────────────────────────────────────────────────────

    pub fn add(&mut self, name: &str) -> Result<(), ManagerError> {
        validate_name(name)?;
        if self.find(name).is_some() {
            return Err(ManagerError::AlreadyExists(name.to_string()));
        }
        self.events.push(ScheduleEvent::named(name));
        self.announce_list();
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> Result<(), ManagerError> {
        let before = self.events.len();
        self.events.retain(|e| e.name != name);
        if self.events.len() == before {
            return Err(ManagerError::NotFound(name.to_string()));
        }
        self.announce_list();
        Ok(())
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), ManagerError> {
        validate_name(to)?;
        if self.find(to).is_some() {
            return Err(ManagerError::AlreadyExists(to.to_string()));
        }
        let event = self
            .find_mut(from)
            .ok_or_else(|| ManagerError::NotFound(from.to_string()))?;
        event.name = to.to_string();
        self.announce_list();
        Ok(())
    }

    /// Merges an imported event by name. The import document already carries
    /// the current values for any field it leaves out, `lastTriggered` included.
    pub fn upsert(&mut self, event: ScheduleEvent) -> Result<(), ManagerError> {
        validate_name(&event.name)?;
        if self.find(&event.name).is_none() {
            self.events.push(event);
            self.announce_list();
            return Ok(());
        }
        let name = event.name.clone();
        let before: Vec<_> = [
            PROP_SCHED_TYPE,
            PROP_FREQUENCY,
            PROP_SCHED_ARGS,
            PROP_OFFSET,
            PROP_LAST_TRIGGERED,
        ]
            .into_iter()
            .filter_map(|p| self.get(&name, p).ok().map(|v| (p, v)))
            .collect();
        if let Some(slot) = self.find_mut(&name) {
            *slot = event;
        }
        for (property, old) in before {
            if let Ok(now) = self.get(&name, property) {
                if now != old {
                    self.bus.value(GROUP_SCHEDULE, &name, property, now);
                }
            }
        }
        Ok(())
    }

    // ── Properties ────────────────────────────────────────────────────────────

    pub fn get(&self, item: &str, property: &str) -> Result<Value, PropertyError> {
        if item.is_empty() {
            return match property {
                PROP_SCHED_LIST => Ok(string_list(self.names())),
                _ => Err(PropertyError::UnknownProperty(property.to_string())),
            };
        }
        let event = self
            .find(item)
            .ok_or_else(|| PropertyError::UnknownItem(item.to_string()))?;
        Ok(match property {
            PROP_SCHED_NAME => Value::from(event.name.as_str()),
            PROP_SCHED_TYPE => Value::from(event.event_type.as_str()),
            PROP_FREQUENCY => Value::from(event.frequency.as_str()),
            PROP_SCHED_ARGS => Value::from(event.arguments.as_str()),
            PROP_OFFSET => Value::from(event.offset),
            PROP_LAST_TRIGGERED => Value::from(format_datetime(event.last_triggered.as_ref())),
            _ => return Err(PropertyError::UnknownProperty(property.to_string())),
        })
    }

    pub fn set(&mut self, item: &str, property: &str, value: &Value) -> Result<(), PropertyError> {
        if item.is_empty() && property == PROP_SCHED_LIST {
            return Err(PropertyError::ReadOnly(property.to_string()));
        }
        let event = self
            .find_mut(item)
            .ok_or_else(|| PropertyError::UnknownItem(item.to_string()))?;
        let changed = match property {
            PROP_SCHED_NAME | PROP_LAST_TRIGGERED => return Err(PropertyError::ReadOnly(property.to_string())),
            PROP_SCHED_TYPE => {
                let text = expect_string(property, value)?;
                let parsed = EventType::parse(&text).ok_or_else(|| PropertyError::InvalidValue {
                    property: property.to_string(),
                    reason: format!("unknown event type '{text}'"),
                })?;
                std::mem::replace(&mut event.event_type, parsed) != parsed
            }
            PROP_FREQUENCY => {
                let text = expect_string(property, value)?;
                let parsed = Frequency::parse(&text).ok_or_else(|| PropertyError::InvalidValue {
                    property: property.to_string(),
                    reason: format!("unknown frequency '{text}'"),
                })?;
                std::mem::replace(&mut event.frequency, parsed) != parsed
            }
            PROP_SCHED_ARGS => {
                let args = expect_string(property, value)?;
                let changed = event.arguments != args;
                event.arguments = args;
                changed
            }
            PROP_OFFSET => {
                let offset = expect_int(property, value)?;
                std::mem::replace(&mut event.offset, offset) != offset
            }
            _ => return Err(PropertyError::UnknownProperty(property.to_string())),
        };
        if changed {
            self.bus.value(GROUP_SCHEDULE, item, property, value.clone());
        }
        Ok(())
    }

    // ── Triggering ────────────────────────────────────────────────────────────

    /// Fires every event due in the minute containing `now`.
    pub fn tick(&mut self, now: DateTime<Local>) {
        let due: Vec<String> = self
            .events
            .iter()
            .filter(|e| should_fire(e.frequency, e.offset, &now))
            .map(|e| e.name.clone())
            .collect();
        if !due.is_empty() {
            self.trigger_events(&due, now);
        }
    }

    /// Fires the named events. `triggerEvents` chains are followed here, and
    /// each event fires at most once per call so cycles terminate.
    pub fn trigger_events(&mut self, names: &[String], now: DateTime<Local>) -> bool {
        let mut all_found = true;
        let mut fired = HashSet::new();
        let mut pending: Vec<String> = names.iter().rev().cloned().collect();
        while let Some(name) = pending.pop() {
            if !fired.insert(name.clone()) {
                continue;
            }
            match self.fire(&name, now) {
                Some(chained) => pending.extend(chained.into_iter().rev()),
                None => {
                    warn!("Trigger of unknown event '{name}'");
                    all_found = false;
                }
            }
        }
        all_found
    }

    /// Records the trigger and queues the action. Returns the events a
    /// `triggerEvents` action chains to, or `None` if the event is unknown.
    fn fire(&mut self, name: &str, now: DateTime<Local>) -> Option<Vec<String>> {
        let event = self.find_mut(name)?;
        info!(
            "Event {}: Triggered; type: {}; arguments: {}",
            event.name,
            event.event_type.as_str(),
            event.arguments
        );
        event.last_triggered = Some(now);
        let event = event.clone();
        self.bus.value(
            GROUP_SCHEDULE,
            &event.name,
            PROP_LAST_TRIGGERED,
            format_datetime(Some(&now)),
        );

        let mut chained = Vec::new();
        match event.event_type {
            EventType::StartApps | EventType::StopApps | EventType::RestartApps => {
                let apps = split_list(&event.arguments);
                if !apps.is_empty() {
                    self.bus.send(match event.event_type {
                        EventType::StartApps => Signal::StartApps(apps),
                        EventType::StopApps => Signal::StopApps(apps),
                        _ => Signal::RestartApps(apps),
                    });
                }
            }
            EventType::StartGroup => self.bus.send(Signal::StartGroup(event.arguments.trim().to_string())),
            EventType::StopGroup => self.bus.send(Signal::StopGroup(event.arguments.trim().to_string())),
            EventType::Shutdown => {
                info!("Scheduled shutdown event: {}", event.arguments);
                self.bus.send(Signal::Shutdown);
            }
            EventType::Reboot => {
                info!("Scheduled reboot event: {}", event.arguments);
                self.bus.send(Signal::Reboot);
            }
            EventType::Screenshot => {
                let path = self.screenshot_path(&event, &now);
                self.bus.send(Signal::Screenshot(path));
            }
            EventType::TriggerEvents => {
                chained = split_list(&event.arguments);
                if chained.contains(&event.name) {
                    warn!("Event {}: Recursive trigger: '{}'", event.name, event.arguments);
                    chained.retain(|n| n != &event.name);
                }
            }
            EventType::Alert => {
                self.bus.alert(format!("[Event {}] {}", event.name, event.arguments));
            }
        }
        Some(chained)
    }

    fn screenshot_path(&self, event: &ScheduleEvent, now: &DateTime<Local>) -> PathBuf {
        let file = event.arguments.trim();
        if file.is_empty() {
            return paths::screenshot_path(&self.data_dir, &event.name, now);
        }
        let stamp = now.format(paths::FILE_DATETIME_FORMAT).to_string();
        self.data_dir.join(file.replace("%DATE%", &stamp))
    }
}
