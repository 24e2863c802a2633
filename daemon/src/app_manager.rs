use anyhow::{bail, Context, Result};
use chrono::Local;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rmpv::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app_io::LoopbackMessage;
use crate::application::{
    split_args, AppError, AppId, AppSettings, Application, ExitOutcome, LaunchContext, SupervisionPolicy,
};
use crate::bus::{Bus, Signal};
use crate::event::{AgentEvent, ProcessEvent};
use crate::paths;
use crate::process;
use crate::property::{string_list, validate_name, ManagerError, PropertyError, GROUP_APP, GROUP_NONE};

pub const PROP_APP_LIST: &str = "appList";

/// Bound on how long a captured `execute` may run before it is killed.
pub const EXECUTE_CAPTURE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AppOpError {
    #[error("App {0} does not exist")]
    NotFound(String),
    #[error("App {name}: {source}")]
    Failed { name: String, source: AppError },
}

/// Registry of supervised applications, kept in insertion order.
///
/// The manager is the only place processes are started or stopped. Other
/// components name applications by string; process tasks address them by
/// `AppId` plus a launch generation so stale reports are dropped.
pub struct AppManager {
    apps: Vec<Application>,
    next_id: u64,
    bus: Bus,
    data_dir: PathBuf,
    events: mpsc::Sender<AgentEvent>,
    policy: SupervisionPolicy,
}

impl AppManager {
    pub fn new(bus: Bus, data_dir: PathBuf, events: mpsc::Sender<AgentEvent>) -> Self {
        Self {
            apps: Vec::new(),
            next_id: 1,
            bus,
            data_dir,
            events,
            policy: SupervisionPolicy::default(),
        }
    }

    pub fn set_policy(&mut self, policy: SupervisionPolicy) {
        self.policy = policy;
    }

    pub fn policy(&self) -> &SupervisionPolicy {
        &self.policy
    }

    // ── Registry ──────────────────────────────────────────────────────────────

    pub fn names(&self) -> Vec<String> {
        self.apps.iter().map(|a| a.name().to_string()).collect()
    }

    pub fn find(&self, name: &str) -> Option<&Application> {
        self.apps.iter().find(|a| a.name() == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut Application> {
        self.apps.iter_mut().find(|a| a.name() == name)
    }

    fn by_id_mut(&mut self, id: AppId) -> Option<&mut Application> {
        self.apps.iter_mut().find(|a| a.id() == id)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn settings(&self) -> Vec<AppSettings> {
        self.apps.iter().map(|a| a.settings().clone()).collect()
    }

    fn announce_list(&self) {
        self.bus.value(GROUP_APP, GROUP_NONE, PROP_APP_LIST, string_list(self.names()));
    }

    fn insert(&mut self, settings: AppSettings) {
        let id = AppId(self.next_id);
        self.next_id += 1;
        self.apps.push(Application::new(id, settings, self.bus.clone()));
    }

    /// Populates the registry from persisted settings without announcing.
    pub fn load(&mut self, settings: Vec<AppSettings>) {
        for s in settings {
            if validate_name(&s.name).is_err() || self.contains(&s.name) {
                warn!("skipping invalid or duplicate application '{}' in settings", s.name);
                continue;
            }
            self.insert(s);
        }
    }

    pub fn add(&mut self, name: &str) -> Result<(), ManagerError> {
        validate_name(name)?;
        if self.contains(name) {
            return Err(ManagerError::AlreadyExists(name.to_string()));
        }
        self.insert(AppSettings::named(name));
        info!("added application '{name}'");
        self.announce_list();
        Ok(())
    }

    /// Adds an application from a full settings entry, or merges it into
    /// the existing one of the same name.
    pub fn upsert(&mut self, settings: AppSettings) -> Result<(), ManagerError> {
        validate_name(&settings.name)?;
        match self.find_mut(&settings.name) {
            Some(app) => app.apply_settings(settings),
            None => {
                self.insert(settings);
                self.announce_list();
            }
        }
        Ok(())
    }

    /// Removes an application, stopping it first if it is running.
    pub fn delete(&mut self, name: &str) -> Result<(), ManagerError> {
        let index = self
            .apps
            .iter()
            .position(|a| a.name() == name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;
        let policy = self.policy.clone();
        let mut app = self.apps.remove(index);
        if app.is_running() {
            let _ = app.stop(false, &policy);
        }
        info!("deleted application '{name}'");
        self.announce_list();
        self.bus.send(Signal::AppDeleted(name.to_string()));
        Ok(())
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), ManagerError> {
        validate_name(to)?;
        if !self.contains(from) {
            return Err(ManagerError::NotFound(from.to_string()));
        }
        if self.contains(to) {
            return Err(ManagerError::AlreadyExists(to.to_string()));
        }
        if let Some(app) = self.find_mut(from) {
            app.rename(to);
        }
        info!("renamed application '{from}' to '{to}'");
        self.announce_list();
        self.bus.send(Signal::AppRenamed {
            from: from.to_string(),
            to: to.to_string(),
        });
        Ok(())
    }

    // ── Properties ────────────────────────────────────────────────────────────

    pub fn get(&self, item: &str, property: &str) -> Result<Value, PropertyError> {
        if item.is_empty() {
            return match property {
                PROP_APP_LIST => Ok(string_list(self.names())),
                _ => Err(PropertyError::UnknownProperty(property.to_string())),
            };
        }
        self.find(item)
            .ok_or_else(|| PropertyError::UnknownItem(item.to_string()))?
            .get(property)
    }

    pub fn set(&mut self, item: &str, property: &str, value: &Value) -> Result<(), PropertyError> {
        self.find_mut(item)
            .ok_or_else(|| PropertyError::UnknownItem(item.to_string()))?
            .set(property, value)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    pub fn start_app(&mut self, name: &str, vars: &[String]) -> Result<(), AppOpError> {
        let index = self
            .apps
            .iter()
            .position(|a| a.name() == name)
            .ok_or_else(|| AppOpError::NotFound(name.to_string()))?;
        let ctx = LaunchContext {
            data_dir: &self.data_dir,
            events: &self.events,
            policy: &self.policy,
        };
        self.apps[index].start(vars, &ctx).map_err(|source| AppOpError::Failed {
            name: name.to_string(),
            source,
        })
    }

    pub fn stop_app(&mut self, name: &str, restart: bool) -> Result<(), AppOpError> {
        let policy = self.policy.clone();
        let app = self
            .find_mut(name)
            .ok_or_else(|| AppOpError::NotFound(name.to_string()))?;
        app.stop(restart, &policy).map_err(|source| AppOpError::Failed {
            name: name.to_string(),
            source,
        })
    }

    /// Restarts a running application; starts one that is not running.
    pub fn restart_app(&mut self, name: &str) -> Result<(), AppOpError> {
        match self.find(name) {
            None => Err(AppOpError::NotFound(name.to_string())),
            Some(app) if app.is_running() => self.stop_app(name, true),
            Some(_) => self.start_app(name, &[]),
        }
    }

    /// Applies `op` to every name. Successes are kept even when a later
    /// name fails; the result is true only if every name succeeded.
    fn for_each_name<F>(&mut self, names: &[String], mut op: F) -> bool
    where
        F: FnMut(&mut Self, &str) -> Result<(), AppOpError>,
    {
        let mut ok = true;
        for name in names {
            if let Err(e) = op(self, name) {
                warn!("{e}");
                ok = false;
            }
        }
        ok
    }

    pub fn start_apps(&mut self, names: &[String]) -> bool {
        self.for_each_name(names, |m, name| m.start_app(name, &[]))
    }

    pub fn stop_apps(&mut self, names: &[String]) -> bool {
        self.for_each_name(names, |m, name| m.stop_app(name, false))
    }

    pub fn restart_apps(&mut self, names: &[String]) -> bool {
        self.for_each_name(names, |m, name| m.restart_app(name))
    }

    pub fn start_startup_apps(&mut self) -> bool {
        let names: Vec<String> = self
            .apps
            .iter()
            .filter(|a| a.launch_at_start() && !a.is_running())
            .map(|a| a.name().to_string())
            .collect();
        self.start_apps(&names)
    }

    pub fn stop_all_apps(&mut self) -> bool {
        let names: Vec<String> = self
            .apps
            .iter()
            .filter(|a| a.is_running())
            .map(|a| a.name().to_string())
            .collect();
        self.stop_apps(&names)
    }

    pub fn running_count(&self) -> usize {
        self.apps.iter().filter(|a| a.is_running()).count()
    }

    // ── Process and side-channel events ───────────────────────────────────────

    pub fn on_process_event(&mut self, id: AppId, generation: u64, event: ProcessEvent) {
        let policy = self.policy.clone();
        let Some(app) = self.by_id_mut(id) else {
            debug!("process event for removed application {id:?}");
            return;
        };
        if app.generation() != generation {
            debug!("App {}: dropping stale event from launch {generation}", app.name());
            return;
        }
        let outcome = match event {
            ProcessEvent::Started { pid } => {
                app.on_started(pid, Local::now());
                return;
            }
            ProcessEvent::FailedToStart(reason) => {
                app.on_start_failed(&reason);
                return;
            }
            ProcessEvent::Cancelled => app.on_exited(None, Local::now(), Instant::now(), &policy),
            ProcessEvent::Exited { code } => app.on_exited(code, Local::now(), Instant::now(), &policy),
        };
        if outcome == ExitOutcome::Restart {
            let ctx = LaunchContext {
                data_dir: &self.data_dir,
                events: &self.events,
                policy: &self.policy,
            };
            if let Some(app) = self.apps.iter_mut().find(|a| a.id() == id) {
                if let Err(e) = app.restart_after_exit(&ctx) {
                    error!("App {}: restart failed: {e}", app.name());
                }
            }
        }
    }

    pub fn on_app_log(&mut self, id: AppId, line: &str) {
        if let Some(app) = self.by_id_mut(id) {
            app.on_log_line(line, Instant::now());
        }
    }

    pub fn on_loopback(&mut self, id: AppId, message: LoopbackMessage) {
        if let Some(app) = self.by_id_mut(id) {
            app.on_loopback(message, Instant::now());
        }
    }

    /// Runs the lockup check over every application.
    pub fn check_heartbeats(&mut self, now: Instant) {
        let policy = self.policy.clone();
        for app in &mut self.apps {
            let Some(lockup) = app.check_heartbeat(now, &policy) else {
                continue;
            };
            if lockup.screenshot {
                let prefix = format!("Lockup-{}", app.name());
                self.bus.send(Signal::LockupScreenshot {
                    app: app.id(),
                    restart: lockup.restart,
                    path: paths::screenshot_path(&self.data_dir, &prefix, &Local::now()),
                });
            }
        }
    }

    pub fn finish_lockup(&mut self, id: AppId, restart: bool) {
        let policy = self.policy.clone();
        if let Some(app) = self.by_id_mut(id) {
            app.finish_lockup(restart, &policy);
        }
    }

    pub fn console_output(&self, name: &str) -> Result<Vec<u8>> {
        if !self.contains(name) {
            bail!("No such app: '{name}'");
        }
        let path = paths::app_output_path(&self.data_dir, name);
        std::fs::read(&path).with_context(|| format!("Error opening console output file {}", path.display()))
    }
}

// ── One-shot execution ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    /// Executable image to run instead of `command`, when non-empty.
    pub file: Vec<u8>,
    pub command: String,
    pub args: String,
    pub directory: String,
    pub capture: bool,
    pub elevated: bool,
}

/// Runs a one-shot command. With `capture` the combined output is returned
/// once the process exits; otherwise the process is left running.
pub async fn execute(req: ExecuteRequest) -> Result<Option<Vec<u8>>> {
    if req.elevated {
        bail!("elevated execution is not available: the agent is not running as a service");
    }
    let args = split_args(&req.args);
    let directory = (!req.directory.is_empty()).then(|| PathBuf::from(&req.directory));

    let temp = if req.file.is_empty() {
        None
    } else {
        Some(write_temp_executable(&req.file).await?)
    };
    let program = match &temp {
        Some(path) => path.clone(),
        None => {
            let cmd = req.command.trim();
            if cmd.is_empty() {
                bail!("no command to execute");
            }
            process::resolve_executable(cmd, directory.as_deref()).unwrap_or_else(|| PathBuf::from(cmd))
        }
    };
    info!("[{}] launching with arguments: {}", program.display(), args.join(" "));

    if req.capture {
        let result = process::run_captured(&program, &args, directory.as_deref(), EXECUTE_CAPTURE_TIMEOUT).await;
        if let Some(path) = &temp {
            remove_temp(path).await;
        }
        return result.map(Some);
    }

    if let Err(e) = process::spawn_detached(&program, &args, directory.as_deref(), temp.clone()) {
        if let Some(path) = &temp {
            remove_temp(path).await;
        }
        return Err(e);
    }
    Ok(None)
}

async fn write_temp_executable(image: &[u8]) -> Result<PathBuf> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let path = std::env::temp_dir().join(format!("pinhole-exec-{suffix}"));
    tokio::fs::write(&path, image)
        .await
        .with_context(|| format!("failed to write temp executable {}", path.display()))?;
    set_owner_executable(&path).await?;
    Ok(path)
}

#[cfg(unix)]
async fn set_owner_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .await
        .with_context(|| format!("failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
async fn set_owner_executable(_path: &Path) -> Result<()> {
    Ok(())
}

async fn remove_temp(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("[{}] temporary executable deleted", path.display()),
        Err(e) => error!("failed to delete temporary executable {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{drain, ValueChange};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    struct Fixture {
        mgr: AppManager,
        signals: UnboundedReceiver<Signal>,
        events: mpsc::Receiver<AgentEvent>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (bus, signals) = Bus::new();
        let (tx, events) = mpsc::channel(64);
        Fixture {
            mgr: AppManager::new(bus, dir.path().to_path_buf(), tx),
            signals,
            events,
            _dir: dir,
        }
    }

    /// Feeds process events back into the manager until `done` holds.
    async fn pump_until<F: Fn(&AppManager) -> bool>(f: &mut Fixture, done: F) {
        timeout(Duration::from_secs(20), async {
            while !done(&f.mgr) {
                match f.events.recv().await {
                    Some(AgentEvent::Process { app, generation, event }) => {
                        f.mgr.on_process_event(app, generation, event)
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        })
        .await
        .unwrap();
    }

    // ── registry ──────────────────────────────────────────────────────────────

    #[test]
    fn app_list_keeps_insertion_order() {
        let mut f = fixture();
        f.mgr.add("web").unwrap();
        f.mgr.add("db").unwrap();
        assert_eq!(
            f.mgr.get("", PROP_APP_LIST).unwrap(),
            string_list(["web", "db"])
        );
    }

    #[test]
    fn add_rejects_duplicates_and_bad_names() {
        let mut f = fixture();
        f.mgr.add("web").unwrap();
        assert_eq!(f.mgr.add("web"), Err(ManagerError::AlreadyExists("web".to_string())));
        assert!(matches!(f.mgr.add(""), Err(ManagerError::InvalidName(_))));
    }

    #[test]
    fn rename_moves_entry_and_announces() {
        let mut f = fixture();
        f.mgr.add("web").unwrap();
        f.mgr.add("db").unwrap();
        drain(&mut f.signals);

        assert_eq!(f.mgr.rename("web", "db"), Err(ManagerError::AlreadyExists("db".to_string())));
        assert_eq!(f.mgr.rename("nope", "x"), Err(ManagerError::NotFound("nope".to_string())));
        f.mgr.rename("web", "site").unwrap();
        assert_eq!(f.mgr.names(), vec!["site", "db"]);

        let got = drain(&mut f.signals);
        assert!(got.contains(&Signal::AppRenamed {
            from: "web".to_string(),
            to: "site".to_string()
        }));
    }

    #[test]
    fn delete_announces_and_cascades() {
        let mut f = fixture();
        f.mgr.add("web").unwrap();
        drain(&mut f.signals);
        f.mgr.delete("web").unwrap();
        assert!(f.mgr.names().is_empty());
        assert_eq!(f.mgr.delete("web"), Err(ManagerError::NotFound("web".to_string())));

        let got = drain(&mut f.signals);
        assert_eq!(
            got,
            vec![
                Signal::Value(ValueChange {
                    group: "app".to_string(),
                    item: String::new(),
                    property: PROP_APP_LIST.to_string(),
                    value: string_list(Vec::<String>::new()),
                }),
                Signal::AppDeleted("web".to_string()),
            ]
        );
    }

    #[test]
    fn property_access_routes_to_application() {
        let mut f = fixture();
        f.mgr.add("web").unwrap();
        f.mgr.set("web", "arguments", &Value::from("-v")).unwrap();
        assert_eq!(f.mgr.get("web", "arguments").unwrap(), Value::from("-v"));
        assert_eq!(
            f.mgr.get("ghost", "arguments"),
            Err(PropertyError::UnknownItem("ghost".to_string()))
        );
        assert_eq!(
            f.mgr.get("", "bogus"),
            Err(PropertyError::UnknownProperty("bogus".to_string()))
        );
    }

    #[test]
    fn upsert_merges_existing_and_adds_new() {
        let mut f = fixture();
        f.mgr.add("web").unwrap();
        f.mgr
            .upsert(AppSettings {
                arguments: "--fast".to_string(),
                ..AppSettings::named("web")
            })
            .unwrap();
        f.mgr.upsert(AppSettings::named("db")).unwrap();
        assert_eq!(f.mgr.names(), vec!["web", "db"]);
        assert_eq!(f.mgr.get("web", "arguments").unwrap(), Value::from("--fast"));
    }

    #[test]
    fn load_skips_duplicates() {
        let mut f = fixture();
        f.mgr.load(vec![
            AppSettings::named("a"),
            AppSettings::named("a"),
            AppSettings::named("b"),
        ]);
        assert_eq!(f.mgr.names(), vec!["a", "b"]);
        assert!(drain(&mut f.signals).is_empty());
    }

    // ── lifecycle ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn start_apps_is_best_effort() {
        let mut f = fixture();
        f.mgr.add("ok").unwrap();
        f.mgr.set("ok", "executable", &Value::from("/bin/sh")).unwrap();
        f.mgr.set("ok", "arguments", &Value::from("-c \"sleep 30\"")).unwrap();

        let ok = f.mgr.start_apps(&["missing".to_string(), "ok".to_string()]);
        assert!(!ok);
        assert!(f.mgr.find("ok").unwrap().is_running());
        assert!(f.mgr.stop_all_apps());
    }

    #[tokio::test]
    async fn stale_generation_is_ignored() {
        let mut f = fixture();
        f.mgr.add("web").unwrap();
        let id = f.mgr.find("web").unwrap().id();
        f.mgr.on_process_event(id, 7, ProcessEvent::Started { pid: 1 });
        assert!(!f.mgr.find("web").unwrap().is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_settles_running_app() {
        let mut f = fixture();
        f.mgr.add("sleeper").unwrap();
        f.mgr.set("sleeper", "executable", &Value::from("/bin/sh")).unwrap();
        f.mgr.set("sleeper", "arguments", &Value::from("-c \"sleep 30\"")).unwrap();
        f.mgr.start_app("sleeper", &[]).unwrap();
        pump_until(&mut f, |m| m.find("sleeper").unwrap().pid().is_some()).await;

        assert_eq!(
            f.mgr.start_app("sleeper", &[]),
            Err(AppOpError::Failed {
                name: "sleeper".to_string(),
                source: AppError::AlreadyRunning
            })
        );
        f.mgr.stop_app("sleeper", false).unwrap();
        pump_until(&mut f, |m| !m.find("sleeper").unwrap().is_running()).await;
        assert_eq!(f.mgr.find("sleeper").unwrap().restarts(), 0);
        assert_eq!(f.mgr.get("sleeper", "state").unwrap(), Value::from("Not running"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn delete_stops_running_process() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let mut f = fixture();
        f.mgr.add("sleeper").unwrap();
        f.mgr.set("sleeper", "executable", &Value::from("/bin/sh")).unwrap();
        f.mgr.set("sleeper", "arguments", &Value::from("-c \"sleep 30\"")).unwrap();
        f.mgr.start_app("sleeper", &[]).unwrap();
        pump_until(&mut f, |m| m.find("sleeper").unwrap().pid().is_some()).await;
        let id = f.mgr.find("sleeper").unwrap().id();
        let pid = f.mgr.find("sleeper").unwrap().pid().unwrap();

        f.mgr.delete("sleeper").unwrap();
        assert!(f.mgr.find("sleeper").is_none());
        assert!(!f.mgr.names().contains(&"sleeper".to_string()));

        let exited = timeout(Duration::from_secs(10), async {
            loop {
                match f.events.recv().await {
                    Some(AgentEvent::Process {
                        app,
                        event: ProcessEvent::Exited { .. },
                        ..
                    }) if app == id => return true,
                    Some(_) => {}
                    None => return false,
                }
            }
        })
        .await
        .unwrap();
        assert!(exited);
        // Reaped by the owning task before it reported the exit.
        assert!(kill(Pid::from_raw(pid as i32), None).is_err());

        // A late report for the deleted app is ignored.
        f.mgr.on_process_event(id, 1, ProcessEvent::Exited { code: None });
        assert!(f.mgr.names().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crash_loop_is_throttled_end_to_end() {
        let mut f = fixture();
        f.mgr.set_policy(SupervisionPolicy {
            crash_count: 2,
            crash_period: Duration::from_secs(60),
            ..SupervisionPolicy::default()
        });
        f.mgr.add("flaky").unwrap();
        f.mgr.set("flaky", "executable", &Value::from("/bin/sh")).unwrap();
        f.mgr.set("flaky", "arguments", &Value::from("-c \"exit 1\"")).unwrap();
        f.mgr.set("flaky", "keepAppRunning", &Value::from(true)).unwrap();
        f.mgr.start_app("flaky", &[]).unwrap();

        // Two restarts are allowed; the third crash settles the app.
        pump_until(&mut f, |m| {
            let app = m.find("flaky").unwrap();
            app.generation() == 3 && !app.is_running()
        })
        .await;

        assert_eq!(f.mgr.find("flaky").unwrap().restarts(), 2);
        let alerts: Vec<_> = drain(&mut f.signals)
            .into_iter()
            .filter(|s| matches!(s, Signal::Alert(_)))
            .collect();
        assert_eq!(alerts.len(), 1);
    }

    #[test]
    fn console_output_requires_known_app_and_file() {
        let mut f = fixture();
        assert!(f.mgr.console_output("web").is_err());
        f.mgr.add("web").unwrap();
        assert!(f.mgr.console_output("web").is_err());

        let path = paths::app_output_path(&f.mgr.data_dir, "web");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(f.mgr.console_output("web").unwrap(), b"hello");
    }

    // ── execute ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn execute_rejects_elevated() {
        let req = ExecuteRequest {
            command: "/bin/true".to_string(),
            elevated: true,
            ..ExecuteRequest::default()
        };
        assert!(execute(req).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_captures_command_output() {
        let req = ExecuteRequest {
            command: "sh".to_string(),
            args: "-c \"echo captured\"".to_string(),
            capture: true,
            ..ExecuteRequest::default()
        };
        let data = execute(req).await.unwrap().unwrap();
        assert_eq!(String::from_utf8(data).unwrap().trim(), "captured");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_runs_uploaded_script_and_removes_it() {
        let req = ExecuteRequest {
            file: b"#!/bin/sh\necho from-blob\n".to_vec(),
            capture: true,
            ..ExecuteRequest::default()
        };
        let data = execute(req).await.unwrap().unwrap();
        assert_eq!(String::from_utf8(data).unwrap().trim(), "from-blob");
        let leftovers = std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("pinhole-exec-"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
