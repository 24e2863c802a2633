//! Command tables for every group, and the query/set routing to the managers.

use chrono::Local;
use rmpv::Value;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::alert_manager::AlertManager;
use crate::app_manager::{execute, AppManager, ExecuteRequest};
use crate::dispatcher::{CommandContext, CommandOutcome, CommandTarget};
use crate::global_manager::{power_off, sysinfo_report, GlobalManager};
use crate::group_manager::GroupManager;
use crate::logging::read_log_range;
use crate::property::{
    format_datetime, ManagerError, PropertyError, GROUP_ALERT, GROUP_APP, GROUP_GLOBAL, GROUP_GROUP, GROUP_NONE,
    GROUP_SCHEDULE,
};
use crate::protocol::ProtocolError;
use crate::schedule::ScheduleManager;
use crate::settings::{export_settings, plan_import, ImportPlan, PersistedSettings};

pub const CMD_IMPORT_SETTINGS: &str = "importSettings";
pub const CMD_EXPORT_SETTINGS: &str = "exportSettings";
pub const CMD_GET_LOG: &str = "getLog";

pub const CMD_ADD_APP: &str = "addApp";
pub const CMD_DELETE_APP: &str = "delApp";
pub const CMD_RENAME_APP: &str = "renApp";
pub const CMD_START_APPS: &str = "startApps";
pub const CMD_START_STARTUP_APPS: &str = "startStartupApps";
pub const CMD_RESTART_APPS: &str = "restartApps";
pub const CMD_STOP_APPS: &str = "stopApps";
pub const CMD_STOP_ALL_APPS: &str = "stopAllApps";
pub const CMD_GET_CONSOLE: &str = "getConsole";
pub const CMD_EXECUTE: &str = "execute";
pub const CMD_START_APP_VARS: &str = "startAppVars";

pub const CMD_ADD_GROUP: &str = "addGroup";
pub const CMD_DELETE_GROUP: &str = "delGroup";
pub const CMD_RENAME_GROUP: &str = "renGroup";
pub const CMD_START_GROUP: &str = "startGroup";
pub const CMD_STOP_GROUP: &str = "stopGroup";

pub const CMD_SHUTDOWN: &str = "shutdown";
pub const CMD_REBOOT: &str = "reboot";
pub const CMD_SYSINFO: &str = "sysinfo";

pub const CMD_ADD_EVENT: &str = "addEvent";
pub const CMD_DELETE_EVENT: &str = "deleteEvent";
pub const CMD_RENAME_EVENT: &str = "renameEvent";
pub const CMD_TRIGGER_EVENTS: &str = "triggerEvents";

pub const CMD_ADD_ALERT_SLOT: &str = "addAlertSlot";
pub const CMD_DELETE_ALERT_SLOT: &str = "delAlertSlot";
pub const CMD_RENAME_ALERT_SLOT: &str = "renAlertSlot";
pub const CMD_RESET_ALERTS: &str = "resetAlerts";
pub const CMD_GET_ALERTS: &str = "getAlerts";

/// All business state, owned by the agent and lent to the dispatcher.
pub struct Managers {
    pub apps: AppManager,
    pub groups: GroupManager,
    pub globals: GlobalManager,
    pub alerts: AlertManager,
    pub schedule: ScheduleManager,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
}

/// Logs a registry failure and reduces it to the wire's success flag.
fn report(result: Result<(), ManagerError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("{e}");
            false
        }
    }
}

impl Managers {
    /// Snapshot of everything persisted except the credentials and server id.
    pub fn persisted(&self) -> PersistedSettings {
        PersistedSettings {
            global: self.globals.settings().clone(),
            applications: self.apps.settings(),
            groups: self.groups.settings(),
            events: self.schedule.events(),
            alert_slots: self.alerts.slots(),
            ..PersistedSettings::default()
        }
    }

    /// Starts the members of `names` that are not already running.
    fn start_idle(&mut self, names: Vec<String>) -> bool {
        let idle: Vec<String> = names
            .into_iter()
            .filter(|m| !self.apps.find(m).is_some_and(|a| a.is_running()))
            .collect();
        self.apps.start_apps(&idle)
    }

    pub fn start_group(&mut self, name: &str) -> bool {
        match self.groups.members(name) {
            Ok(members) => self.start_idle(members),
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    /// Stops every running member of `name`.
    pub fn stop_group(&mut self, name: &str) -> bool {
        let members = match self.groups.members(name) {
            Ok(members) => members,
            Err(e) => {
                warn!("{e}");
                return false;
            }
        };
        let running: Vec<String> = members
            .into_iter()
            .filter(|m| self.apps.find(m).is_some_and(|a| a.is_running()))
            .collect();
        self.apps.stop_apps(&running)
    }

    /// Members of every `launchAtStart` group.
    pub fn start_startup_groups(&mut self) -> bool {
        let members = self.groups.startup_members();
        self.start_idle(members)
    }

    /// Applies an import plan: upserts first, then deletions, per section.
    pub fn apply_import(&mut self, plan: ImportPlan) {
        if let Some(global) = plan.global {
            self.globals.apply_settings(global);
        }
        if let Some(section) = plan.applications {
            for app in section.upserts {
                report(self.apps.upsert(app));
            }
            for name in section.deletes {
                report(self.apps.delete(&name));
            }
        }
        if let Some(section) = plan.groups {
            for group in section.upserts {
                report(self.groups.upsert(group));
            }
            for name in section.deletes {
                report(self.groups.delete(&name));
            }
        }
        if let Some(section) = plan.events {
            for event in section.upserts {
                report(self.schedule.upsert(event));
            }
            for name in section.deletes {
                report(self.schedule.delete(&name));
            }
        }
        if let Some(section) = plan.alert_slots {
            for slot in section.upserts {
                report(self.alerts.upsert(slot));
            }
            for name in section.deletes {
                report(self.alerts.delete_slot(&name));
            }
        }
    }

    fn export(&self) -> CommandOutcome {
        let doc = export_settings(&self.persisted(), |name| {
            self.apps
                .find(name)
                .map(|a| (format_datetime(a.last_started()), format_datetime(a.last_exited())))
                .unwrap_or_default()
        });
        match doc.and_then(|doc| serde_json::to_vec_pretty(&doc)) {
            Ok(bytes) => CommandOutcome::Data(Value::Binary(bytes)),
            Err(e) => {
                warn!("failed to export settings: {e}");
                CommandOutcome::Failed
            }
        }
    }

    fn none_command(&mut self, ctx: &CommandContext<'_>, sub: &str) -> Result<CommandOutcome, ProtocolError> {
        Ok(match sub {
            CMD_IMPORT_SETTINGS => {
                let data = ctx.args(CMD_IMPORT_SETTINGS).bytes()?;
                match plan_import(&data, &self.persisted()) {
                    Ok(plan) => {
                        info!("Settings imported by {} {}", ctx.client, ctx.host_name);
                        self.apply_import(plan);
                        CommandOutcome::Success
                    }
                    Err(e) => {
                        warn!(
                            "Error importing settings size {} from client {} {}: {e}",
                            data.len(),
                            ctx.client,
                            ctx.host_name
                        );
                        CommandOutcome::Failed
                    }
                }
            }
            CMD_EXPORT_SETTINGS => self.export(),
            CMD_GET_LOG => {
                let mut args = ctx.args(CMD_GET_LOG);
                let (start, end) = (args.string()?, args.string()?);
                match read_log_range(&self.log_dir, &start, &end) {
                    Some(data) => CommandOutcome::Data(Value::Binary(data)),
                    None => CommandOutcome::Failed,
                }
            }
            _ => CommandOutcome::Unknown,
        })
    }

    fn app_command(&mut self, ctx: &CommandContext<'_>, sub: &str) -> Result<CommandOutcome, ProtocolError> {
        let mut args = ctx.args(CMD_COMMAND_APP);
        Ok(match sub {
            CMD_ADD_APP => report(self.apps.add(&args.string()?)).into(),
            CMD_DELETE_APP => report(self.apps.delete(&args.string()?)).into(),
            CMD_RENAME_APP => {
                let (from, to) = (args.string()?, args.string()?);
                report(self.apps.rename(&from, &to)).into()
            }
            CMD_START_APPS => self.apps.start_apps(&args.string_list()?).into(),
            CMD_START_STARTUP_APPS => self.apps.start_startup_apps().into(),
            CMD_RESTART_APPS => self.apps.restart_apps(&args.string_list()?).into(),
            CMD_STOP_APPS => self.apps.stop_apps(&args.string_list()?).into(),
            CMD_STOP_ALL_APPS => self.apps.stop_all_apps().into(),
            CMD_GET_CONSOLE => match self.apps.console_output(&args.string()?) {
                Ok(data) => CommandOutcome::Data(Value::Binary(data)),
                Err(e) => {
                    warn!("{e:#}");
                    CommandOutcome::Failed
                }
            },
            CMD_EXECUTE => {
                let req = ExecuteRequest {
                    file: args.bytes()?,
                    command: args.string()?,
                    args: args.string()?,
                    directory: args.string()?,
                    capture: args.bool()?,
                    elevated: args.bool()?,
                };
                CommandOutcome::Pending(Box::pin(async move {
                    let output = execute(req).await?;
                    Ok::<_, anyhow::Error>(output.map(Value::Binary))
                }))
            }
            CMD_START_APP_VARS => {
                let (name, vars) = (args.string()?, args.string_list()?);
                match self.apps.start_app(&name, &vars) {
                    Ok(()) => CommandOutcome::Success,
                    Err(e) => {
                        warn!("{e}");
                        CommandOutcome::Failed
                    }
                }
            }
            _ => CommandOutcome::Unknown,
        })
    }

    fn group_command(&mut self, ctx: &CommandContext<'_>, sub: &str) -> Result<CommandOutcome, ProtocolError> {
        let mut args = ctx.args(CMD_COMMAND_GROUP);
        Ok(match sub {
            CMD_ADD_GROUP => report(self.groups.add(&args.string()?)).into(),
            CMD_DELETE_GROUP => report(self.groups.delete(&args.string()?)).into(),
            CMD_RENAME_GROUP => {
                let (from, to) = (args.string()?, args.string()?);
                report(self.groups.rename(&from, &to)).into()
            }
            CMD_START_GROUP => self.start_group(&args.string()?).into(),
            CMD_STOP_GROUP => self.stop_group(&args.string()?).into(),
            _ => CommandOutcome::Unknown,
        })
    }

    fn global_command(&mut self, sub: &str) -> CommandOutcome {
        match sub {
            CMD_SHUTDOWN => power_off(false).into(),
            CMD_REBOOT => power_off(true).into(),
            CMD_SYSINFO => CommandOutcome::Data(Value::Binary(sysinfo_report(&self.data_dir).into_bytes())),
            _ => CommandOutcome::Unknown,
        }
    }

    fn schedule_command(&mut self, ctx: &CommandContext<'_>, sub: &str) -> Result<CommandOutcome, ProtocolError> {
        let mut args = ctx.args(CMD_COMMAND_SCHEDULE);
        Ok(match sub {
            CMD_ADD_EVENT => report(self.schedule.add(&args.string()?)).into(),
            CMD_DELETE_EVENT => report(self.schedule.delete(&args.string()?)).into(),
            CMD_RENAME_EVENT => {
                let (from, to) = (args.string()?, args.string()?);
                report(self.schedule.rename(&from, &to)).into()
            }
            CMD_TRIGGER_EVENTS => self.schedule.trigger_events(&args.string_list()?, Local::now()).into(),
            _ => CommandOutcome::Unknown,
        })
    }

    fn alert_command(&mut self, ctx: &CommandContext<'_>, sub: &str) -> Result<CommandOutcome, ProtocolError> {
        let mut args = ctx.args(CMD_COMMAND_ALERT);
        Ok(match sub {
            CMD_ADD_ALERT_SLOT => report(self.alerts.add_slot(&args.string()?)).into(),
            CMD_DELETE_ALERT_SLOT => report(self.alerts.delete_slot(&args.string()?)).into(),
            CMD_RENAME_ALERT_SLOT => {
                let (from, to) = (args.string()?, args.string()?);
                report(self.alerts.rename_slot(&from, &to)).into()
            }
            CMD_RESET_ALERTS => {
                self.alerts.reset_alerts();
                CommandOutcome::Success
            }
            CMD_GET_ALERTS => CommandOutcome::Data(Value::Binary(self.alerts.alert_list().into_bytes())),
            _ => CommandOutcome::Unknown,
        })
    }
}

// Names used in argument errors, so a bad packet says which table rejected it.
const CMD_COMMAND_APP: &str = "cmd app";
const CMD_COMMAND_GROUP: &str = "cmd grp";
const CMD_COMMAND_SCHEDULE: &str = "cmd sch";
const CMD_COMMAND_ALERT: &str = "cmd alr";

impl CommandTarget for Managers {
    fn query(&self, group: &str, item: &str, property: &str) -> Option<Value> {
        let result = match group {
            GROUP_APP => self.apps.get(item, property),
            GROUP_GROUP => self.groups.get(item, property),
            GROUP_GLOBAL => self.globals.get(item, property),
            GROUP_SCHEDULE => self.schedule.get(item, property),
            GROUP_ALERT => self.alerts.get(item, property),
            _ => Err(PropertyError::UnknownItem(group.to_string())),
        };
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("query {group}/{item}/{property}: {e}");
                None
            }
        }
    }

    fn set_value(&mut self, group: &str, item: &str, property: &str, value: &Value) -> bool {
        let result = match group {
            GROUP_APP => self.apps.set(item, property, value),
            GROUP_GROUP => self.groups.set(item, property, value),
            GROUP_GLOBAL => self.globals.set(item, property, value),
            GROUP_SCHEDULE => self.schedule.set(item, property, value),
            GROUP_ALERT => self.alerts.set(item, property, value),
            _ => Err(PropertyError::UnknownItem(group.to_string())),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("set {group}/{item}/{property}: {e}");
                false
            }
        }
    }

    fn command(&mut self, ctx: &CommandContext<'_>, group: &str, sub: &str) -> Result<CommandOutcome, ProtocolError> {
        match group {
            GROUP_NONE => self.none_command(ctx, sub),
            GROUP_APP => self.app_command(ctx, sub),
            GROUP_GROUP => self.group_command(ctx, sub),
            GROUP_GLOBAL => Ok(self.global_command(sub)),
            GROUP_SCHEDULE => self.schedule_command(ctx, sub),
            GROUP_ALERT => self.alert_command(ctx, sub),
            _ => Ok(CommandOutcome::Unknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::global_manager::GlobalSettings;
    use crate::group_manager::PROP_GROUP_LIST;
    use crate::property::string_list;
    use tokio::sync::mpsc;

    struct Fixture {
        managers: Managers,
        _events: mpsc::Receiver<crate::event::AgentEvent>,
        _signals: mpsc::UnboundedReceiver<crate::bus::Signal>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (bus, signals) = Bus::new();
        let (tx, events) = mpsc::channel(16);
        let managers = Managers {
            apps: AppManager::new(bus.clone(), dir.path().to_path_buf(), tx),
            groups: GroupManager::new(bus.clone()),
            globals: GlobalManager::new(GlobalSettings::default(), bus.clone()),
            alerts: AlertManager::new(dir.path(), bus.clone()),
            schedule: ScheduleManager::new(dir.path(), bus),
            data_dir: dir.path().to_path_buf(),
            log_dir: dir.path().join("logs"),
        };
        Fixture {
            managers,
            _events: events,
            _signals: signals,
            _dir: dir,
        }
    }

    fn run(m: &mut Managers, group: &str, sub: &str, args: Vec<Value>) -> Result<CommandOutcome, ProtocolError> {
        let mut items = vec![Value::from("cmd"), Value::from(group), Value::from(sub)];
        items.extend(args);
        let ctx = CommandContext {
            client: "TCP:10.0.0.2:4000",
            host_name: "console",
            items: &items,
        };
        m.command(&ctx, group, sub)
    }

    fn succeeded(outcome: Result<CommandOutcome, ProtocolError>) -> bool {
        matches!(outcome, Ok(CommandOutcome::Success))
    }

    // ── registries ────────────────────────────────────────────────────────────

    #[test]
    fn app_add_rename_delete_through_commands() {
        let mut f = fixture();
        let m = &mut f.managers;
        assert!(succeeded(run(m, GROUP_APP, CMD_ADD_APP, vec!["web".into()])));
        assert!(!succeeded(run(m, GROUP_APP, CMD_ADD_APP, vec!["web".into()])));
        assert!(succeeded(run(m, GROUP_APP, CMD_RENAME_APP, vec!["web".into(), "site".into()])));
        assert_eq!(m.query(GROUP_APP, "", "appList"), Some(string_list(["site"])));
        assert!(succeeded(run(m, GROUP_APP, CMD_DELETE_APP, vec!["site".into()])));
        assert_eq!(m.query(GROUP_APP, "", "appList"), Some(string_list(Vec::<String>::new())));
    }

    #[test]
    fn group_commands_and_properties() {
        let mut f = fixture();
        let m = &mut f.managers;
        assert!(succeeded(run(m, GROUP_GROUP, CMD_ADD_GROUP, vec!["lobby".into()])));
        assert_eq!(m.query(GROUP_GROUP, "", PROP_GROUP_LIST), Some(string_list(["lobby"])));
        assert!(!m.start_group("nowhere"));
        assert!(!m.stop_group("nowhere"));
        // An empty group has nothing to start.
        assert!(succeeded(run(m, GROUP_GROUP, CMD_START_GROUP, vec!["lobby".into()])));
    }

    #[test]
    fn wrong_argument_type_is_a_protocol_error() {
        let mut f = fixture();
        assert!(run(&mut f.managers, GROUP_APP, CMD_ADD_APP, vec![5.into()]).is_err());
        assert!(f.managers.apps.names().is_empty());
    }

    #[test]
    fn unknown_group_or_sub_command() {
        let mut f = fixture();
        let m = &mut f.managers;
        assert!(matches!(run(m, "zzz", "anything", vec![]), Ok(CommandOutcome::Unknown)));
        assert!(matches!(run(m, GROUP_APP, "frobnicate", vec![]), Ok(CommandOutcome::Unknown)));
        assert!(m.query("zzz", "", "x").is_none());
        assert!(!m.set_value("zzz", "", "x", &Value::from(1)));
    }

    #[test]
    fn alerts_are_listed_as_binary() {
        let mut f = fixture();
        let m = &mut f.managers;
        m.alerts.generate_alert("disk low", chrono::Local::now());
        match run(m, GROUP_ALERT, CMD_GET_ALERTS, vec![]) {
            Ok(CommandOutcome::Data(Value::Binary(text))) => {
                assert!(String::from_utf8(text).unwrap().contains("disk low"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(succeeded(run(m, GROUP_ALERT, CMD_RESET_ALERTS, vec![])));
        assert_eq!(m.alerts.count(), 0);
    }

    // ── import / export ───────────────────────────────────────────────────────

    #[test]
    fn import_upserts_then_deletes() {
        let mut f = fixture();
        let m = &mut f.managers;
        m.apps.add("old").unwrap();
        let doc = serde_json::json!({
            "ApplicationSettings": {
                "Applications": [{ "appName": "new", "executable": "/bin/true" }]
            },
            "GroupSettings": {
                "Groups": [{ "groupName": "all", "applications": ["new"] }]
            }
        });
        let data = doc.to_string().into_bytes();
        assert!(succeeded(run(m, GROUP_NONE, CMD_IMPORT_SETTINGS, vec![Value::Binary(data)])));
        assert_eq!(m.apps.names(), vec!["new"]);
        assert_eq!(m.groups.members("all").unwrap(), vec!["new"]);
    }

    #[test]
    fn malformed_import_fails_without_changes() {
        let mut f = fixture();
        let m = &mut f.managers;
        m.apps.add("keep").unwrap();
        let outcome = run(m, GROUP_NONE, CMD_IMPORT_SETTINGS, vec![Value::Binary(b"{not json".to_vec())]);
        assert!(matches!(outcome, Ok(CommandOutcome::Failed)));
        assert_eq!(m.apps.names(), vec!["keep"]);
    }

    #[test]
    fn export_produces_importable_json() {
        let mut f = fixture();
        let m = &mut f.managers;
        m.apps.add("web").unwrap();
        let Ok(CommandOutcome::Data(Value::Binary(data))) = run(m, GROUP_NONE, CMD_EXPORT_SETTINGS, vec![]) else {
            panic!("export did not return data");
        };
        let doc: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(doc["ApplicationSettings"]["Applications"][0]["appName"], "web");

        let plan = plan_import(&data, &m.persisted()).unwrap();
        assert!(plan.applications.unwrap().deletes.is_empty());
    }

    #[test]
    fn get_log_with_bad_dates_fails() {
        let mut f = fixture();
        let outcome = run(&mut f.managers, GROUP_NONE, CMD_GET_LOG, vec!["yesterday".into(), "today".into()]);
        assert!(matches!(outcome, Ok(CommandOutcome::Failed)));
    }
}
