//! Persisted agent state (`settings.toml`) and the JSON import/export format.
//!
//! The TOML file is the agent's own store and is rewritten wholesale. The
//! JSON format is what consoles exchange: one object per manager, entries
//! keyed by their wire property names, merged into the live state by name.

use anyhow::{Context, Result};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::path::Path;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::alert_manager::AlertSlot;
use crate::application::AppSettings;
use crate::global_manager::GlobalSettings;
use crate::group_manager::GroupSettings;
use crate::schedule::ScheduleEvent;

pub const TAG_GLOBAL: &str = "GlobalSettings";
pub const TAG_APPS: &str = "ApplicationSettings";
pub const TAG_GROUPS: &str = "GroupSettings";
pub const TAG_SCHEDULE: &str = "ScheduleSettings";
pub const TAG_ALERTS: &str = "AlertSettings";
pub const TAG_APPLICATIONS: &str = "Applications";
pub const TAG_GROUP_LIST: &str = "Groups";
pub const TAG_EVENTS: &str = "Events";
pub const TAG_ALERT_SLOTS: &str = "AlertSlots";
/// Keep entries missing from the import instead of deleting them.
pub const TAG_NO_DELETE: &str = "nodelete";
/// Delete the listed entries instead of merging them. Spelling is part of the format.
pub const TAG_DELETE_ENTRIES: &str = "deleteentires";

/// Everything the agent keeps across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedSettings {
    pub salt: String,
    pub hash: String,
    pub server_id: String,
    pub global: GlobalSettings,
    pub applications: Vec<AppSettings>,
    pub groups: Vec<GroupSettings>,
    pub events: Vec<ScheduleEvent>,
    pub alert_slots: Vec<AlertSlot>,
}

pub fn generate_server_id() -> String {
    hex::encode(rand::thread_rng().gen::<[u8; 16]>())
}

/// Loads `settings.toml`. A missing file yields defaults; either way the
/// result carries a server id.
pub fn load_settings(path: &Path) -> Result<PersistedSettings> {
    let mut settings = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        toml::from_str::<PersistedSettings>(&content)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))?
    } else {
        info!("no settings at {}, starting with defaults", path.display());
        PersistedSettings::default()
    };
    if settings.server_id.is_empty() {
        settings.server_id = generate_server_id();
    }
    Ok(settings)
}

fn try_write(path: &Path, settings: &PersistedSettings) -> Result<()> {
    let content = toml::to_string_pretty(settings).context("Failed to serialize settings")?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    // Write-then-rename so a crash mid-save never leaves a truncated file.
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))
}

/// Saves the settings, logging instead of failing.
pub fn write_settings(path: &Path, settings: &PersistedSettings) -> bool {
    match try_write(path, settings) {
        Ok(()) => true,
        Err(e) => {
            error!("{e:#}");
            false
        }
    }
}

// ── JSON import ───────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("import data is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("import data has no known settings tag")]
    MissingTags,
    #[error("invalid {section} entry: {reason}")]
    Entry { section: &'static str, reason: String },
}

/// The changes one section of an import makes, in application order:
/// upserts first, then deletions.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionPlan<T> {
    pub upserts: Vec<T>,
    pub deletes: Vec<String>,
}

impl<T> Default for SectionPlan<T> {
    fn default() -> Self {
        Self {
            upserts: Vec::new(),
            deletes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportPlan {
    pub global: Option<GlobalSettings>,
    pub applications: Option<SectionPlan<AppSettings>>,
    pub groups: Option<SectionPlan<GroupSettings>>,
    pub events: Option<SectionPlan<ScheduleEvent>>,
    pub alert_slots: Option<SectionPlan<AlertSlot>>,
}

/// Overlays the keys present in `patch` onto the serialized form of `current`.
fn merge<T: Serialize + DeserializeOwned>(
    section: &'static str,
    current: &T,
    patch: &Map<String, Json>,
) -> Result<T, ImportError> {
    let mut base = serde_json::to_value(current)?;
    if let Json::Object(fields) = &mut base {
        for (key, value) in patch {
            fields.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value(base).map_err(|e| ImportError::Entry {
        section,
        reason: e.to_string(),
    })
}

/// Builds the plan for one named-entry section (`Applications`, `Groups`, ...).
fn plan_section<T, N, F>(
    section: &'static str,
    root: &Map<String, Json>,
    list_tag: &str,
    name_key: &str,
    existing: &[T],
    name_of: N,
    fresh: F,
) -> Result<SectionPlan<T>, ImportError>
where
    T: Serialize + DeserializeOwned,
    N: Fn(&T) -> &str,
    F: Fn(&str) -> T,
{
    let Some(entries) = root.get(list_tag).and_then(Json::as_array) else {
        warn!("JSON import data missing tag {list_tag}");
        return Ok(SectionPlan::default());
    };
    let flag = |tag: &str| root.get(tag).and_then(Json::as_bool).unwrap_or(false);

    let mut plan = SectionPlan::default();
    let mut listed = Vec::new();
    for entry in entries {
        let Some(fields) = entry.as_object() else {
            warn!("JSON {list_tag} entry is not an object");
            continue;
        };
        let Some(name) = fields.get(name_key).and_then(Json::as_str) else {
            warn!("JSON {list_tag} entry has no {name_key}");
            continue;
        };
        listed.push(name.to_string());
        if flag(TAG_DELETE_ENTRIES) {
            continue;
        }
        let merged = match existing.iter().find(|e| name_of(e) == name) {
            Some(current) => merge(section, current, fields)?,
            None => merge(section, &fresh(name), fields)?,
        };
        plan.upserts.push(merged);
    }

    if flag(TAG_DELETE_ENTRIES) {
        plan.deletes = listed;
    } else if !flag(TAG_NO_DELETE) {
        plan.deletes = existing
            .iter()
            .map(|e| name_of(e).to_string())
            .filter(|n| !listed.contains(n))
            .collect();
    }
    Ok(plan)
}

/// Parses an import document against the current state.
pub fn plan_import(data: &[u8], current: &PersistedSettings) -> Result<ImportPlan, ImportError> {
    let doc: Json = serde_json::from_slice(data)?;
    let section = |tag: &str| doc.get(tag).and_then(Json::as_object);
    if [TAG_GLOBAL, TAG_APPS, TAG_GROUPS, TAG_SCHEDULE, TAG_ALERTS]
        .iter()
        .all(|t| doc.get(*t).is_none())
    {
        return Err(ImportError::MissingTags);
    }

    let mut plan = ImportPlan::default();
    if let Some(global) = section(TAG_GLOBAL) {
        plan.global = Some(merge("global", &current.global, global)?);
    }
    if let Some(root) = section(TAG_APPS) {
        plan.applications = Some(plan_section(
            "application",
            root,
            TAG_APPLICATIONS,
            "appName",
            &current.applications,
            |a| a.name.as_str(),
            AppSettings::named,
        )?);
    }
    if let Some(root) = section(TAG_GROUPS) {
        plan.groups = Some(plan_section(
            "group",
            root,
            TAG_GROUP_LIST,
            "groupName",
            &current.groups,
            |g| g.name.as_str(),
            GroupSettings::named,
        )?);
    }
    if let Some(root) = section(TAG_SCHEDULE) {
        plan.events = Some(plan_section(
            "event",
            root,
            TAG_EVENTS,
            "schedName",
            &current.events,
            |e| e.name.as_str(),
            ScheduleEvent::named,
        )?);
    }
    if let Some(root) = section(TAG_ALERTS) {
        plan.alert_slots = Some(plan_section(
            "alert slot",
            root,
            TAG_ALERT_SLOTS,
            "alertSlotName",
            &current.alert_slots,
            |s| s.name.as_str(),
            AlertSlot::named,
        )?);
    }
    Ok(plan)
}

// ── JSON export ───────────────────────────────────────────────────────────────

/// Start and exit timestamps of an application, already in wire format.
pub type AppTimes = (String, String);

/// Produces the five-section export document. `app_times` supplies the
/// `lastStarted`/`lastExited` pair for each application by name.
pub fn export_settings(
    current: &PersistedSettings,
    app_times: impl Fn(&str) -> AppTimes,
) -> Result<Json, serde_json::Error> {
    let mut applications = Vec::with_capacity(current.applications.len());
    for app in &current.applications {
        let mut entry = serde_json::to_value(app)?;
        if let Json::Object(fields) = &mut entry {
            let (started, exited) = app_times(&app.name);
            fields.insert("lastStarted".to_string(), Json::from(started));
            fields.insert("lastExited".to_string(), Json::from(exited));
        }
        applications.push(entry);
    }

    let wrap = |tag: &str, list: Json| {
        let mut section = Map::new();
        section.insert(tag.to_string(), list);
        Json::Object(section)
    };
    let mut doc = Map::new();
    doc.insert(TAG_GLOBAL.to_string(), serde_json::to_value(&current.global)?);
    doc.insert(TAG_APPS.to_string(), wrap(TAG_APPLICATIONS, Json::Array(applications)));
    doc.insert(
        TAG_GROUPS.to_string(),
        wrap(TAG_GROUP_LIST, serde_json::to_value(&current.groups)?),
    );
    doc.insert(
        TAG_SCHEDULE.to_string(),
        wrap(TAG_EVENTS, serde_json::to_value(&current.events)?),
    );
    doc.insert(
        TAG_ALERTS.to_string(),
        wrap(TAG_ALERT_SLOTS, serde_json::to_value(&current.alert_slots)?),
    );
    Ok(Json::Object(doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{EventType, Frequency};
    use chrono::{Local, TimeZone};

    fn sample() -> PersistedSettings {
        let mut web = AppSettings::named("web");
        web.executable = "/usr/bin/web".to_string();
        web.keep_app_running = true;
        web.environment = vec!["PORT=80".to_string()];
        PersistedSettings {
            salt: "s".to_string(),
            hash: "h".to_string(),
            server_id: "abc".to_string(),
            global: GlobalSettings::default(),
            applications: vec![web, AppSettings::named("db")],
            groups: vec![GroupSettings {
                name: "all".to_string(),
                applications: vec!["web".to_string(), "db".to_string()],
                launch_at_start: true,
            }],
            events: vec![ScheduleEvent {
                name: "nightly".to_string(),
                event_type: EventType::RestartApps,
                frequency: Frequency::Daily,
                arguments: "web".to_string(),
                offset: 120,
                last_triggered: Local.with_ymd_and_hms(2024, 6, 12, 2, 0, 0).single(),
            }],
            alert_slots: vec![AlertSlot::named("ops")],
        }
    }

    // ── toml ──────────────────────────────────────────────────────────────────

    #[test]
    fn toml_round_trip_preserves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let settings = sample();
        assert!(write_settings(&path, &settings));
        assert_eq!(load_settings(&path).unwrap(), settings);
    }

    #[test]
    fn toml_keeps_last_triggered_in_wire_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut settings = sample();
        settings.events.push(ScheduleEvent::named("never"));
        assert!(write_settings(&path, &settings));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains(r#"lastTriggered = "2024-06-12 02:00:00""#));
        let loaded = load_settings(&path).unwrap();
        assert!(loaded.events[0].last_triggered.is_some());
        assert_eq!(loaded.events[0].last_triggered, settings.events[0].last_triggered);
        assert_eq!(loaded.events[1].last_triggered, None);
    }

    #[test]
    fn missing_file_gets_a_fresh_server_id() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_settings(&dir.path().join("settings.toml")).unwrap();
        assert_eq!(loaded.server_id.len(), 32);
        assert!(loaded.server_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(loaded.applications.is_empty());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "applications = 3").unwrap();
        assert!(load_settings(&path).is_err());
    }

    // ── import ────────────────────────────────────────────────────────────────

    #[test]
    fn export_then_import_reproduces_applications() {
        let current = sample();
        let doc = export_settings(&current, |_| (String::new(), String::new())).unwrap();
        let plan = plan_import(doc.to_string().as_bytes(), &current).unwrap();
        let apps = plan.applications.unwrap();
        assert_eq!(apps.upserts, current.applications);
        assert!(apps.deletes.is_empty());
        assert_eq!(plan.events.unwrap().upserts, current.events);
        assert_eq!(plan.global, Some(current.global));
    }

    #[test]
    fn json_carries_last_triggered_both_ways() {
        let current = sample();
        let doc = export_settings(&current, |_| (String::new(), String::new())).unwrap();
        assert_eq!(doc[TAG_SCHEDULE][TAG_EVENTS][0]["lastTriggered"], "2024-06-12 02:00:00");

        let doc = serde_json::json!({
            "ScheduleSettings": {
                "Events": [{ "schedName": "nightly", "lastTriggered": "2024-07-01 03:04:05" }]
            }
        });
        let events = plan_import(doc.to_string().as_bytes(), &current)
            .unwrap()
            .events
            .unwrap();
        assert_eq!(
            events.upserts[0].last_triggered,
            Local.with_ymd_and_hms(2024, 7, 1, 3, 4, 5).single()
        );
        assert_eq!(events.upserts[0].offset, 120);
    }

    #[test]
    fn import_merges_partial_entries_and_deletes_absent_ones() {
        let current = sample();
        let doc = serde_json::json!({
            "ApplicationSettings": {
                "Applications": [{ "appName": "web", "softTerminate": true }]
            }
        });
        let plan = plan_import(doc.to_string().as_bytes(), &current).unwrap();
        let apps = plan.applications.unwrap();
        assert_eq!(apps.upserts.len(), 1);
        assert!(apps.upserts[0].soft_terminate);
        assert_eq!(apps.upserts[0].executable, "/usr/bin/web");
        assert_eq!(apps.deletes, vec!["db"]);
        assert!(plan.groups.is_none());
    }

    #[test]
    fn nodelete_keeps_absent_entries() {
        let current = sample();
        let doc = serde_json::json!({
            "ApplicationSettings": {
                "nodelete": true,
                "Applications": [{ "appName": "cache" }]
            }
        });
        let apps = plan_import(doc.to_string().as_bytes(), &current)
            .unwrap()
            .applications
            .unwrap();
        assert_eq!(apps.upserts, vec![AppSettings::named("cache")]);
        assert!(apps.deletes.is_empty());
    }

    #[test]
    fn deleteentires_deletes_listed_names() {
        let current = sample();
        let doc = serde_json::json!({
            "GroupSettings": {
                "deleteentires": true,
                "Groups": [{ "groupName": "all" }]
            }
        });
        let groups = plan_import(doc.to_string().as_bytes(), &current)
            .unwrap()
            .groups
            .unwrap();
        assert!(groups.upserts.is_empty());
        assert_eq!(groups.deletes, vec!["all"]);
    }

    #[test]
    fn import_without_known_tags_fails() {
        let current = sample();
        assert!(matches!(
            plan_import(br#"{"Other": {}}"#, &current),
            Err(ImportError::MissingTags)
        ));
        assert!(matches!(plan_import(b"not json", &current), Err(ImportError::Json(_))));
    }

    #[test]
    fn wrongly_typed_field_fails_the_import() {
        let current = sample();
        let doc = serde_json::json!({
            "ApplicationSettings": { "Applications": [{ "appName": "web", "launchDelay": "soon" }] }
        });
        assert!(matches!(
            plan_import(doc.to_string().as_bytes(), &current),
            Err(ImportError::Entry { .. })
        ));
    }

    // ── export ────────────────────────────────────────────────────────────────

    #[test]
    fn export_includes_app_times_and_all_sections() {
        let doc = export_settings(&sample(), |name| {
            (format!("{name}-started"), String::new())
        })
        .unwrap();
        for tag in [TAG_GLOBAL, TAG_APPS, TAG_GROUPS, TAG_SCHEDULE, TAG_ALERTS] {
            assert!(doc.get(tag).is_some(), "missing {tag}");
        }
        let web = &doc[TAG_APPS][TAG_APPLICATIONS][0];
        assert_eq!(web["appName"], "web");
        assert_eq!(web["lastStarted"], "web-started");
        assert_eq!(web["heatbeatTimeout"], Json::Null);
        assert_eq!(doc[TAG_GLOBAL]["heatbeatTimeout"], 5000);
    }
}
