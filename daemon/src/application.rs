//! One supervised application: its persisted settings, its runtime state,
//! and the lifecycle state machine driven by process events.
//!
//! The application never spawns or signals a process itself. It hands a
//! `LaunchSpec` to `process::launch` and keeps the returned handle; every
//! later transition comes back through `on_started`/`on_exited` as the
//! owning task reports it.

use chrono::{DateTime, Local};
use rmpv::Value;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::app_io::{parse_log_line, AppChannels, LogMessage, LoopbackMessage};
use crate::bus::{Bus, Signal};
use crate::crash_counter::CrashCounter;
use crate::event::AgentEvent;
use crate::logging::log_at;
use crate::paths;
use crate::process::{self, CaptureSpec, KillMode, LaunchSpec, ProcessHandle};
use crate::property::{
    expect_bool, expect_in_range, expect_int, expect_string, expect_string_list, format_datetime,
    string_list, PropertyError, GROUP_APP,
};

pub const DEFAULT_LOOPBACK_PORT: u16 = 9999;
pub const LAUNCH_DISPLAYS: [&str; 4] = ["normal", "hidden", "minimize", "maximize"];

/// Stable arena key. Survives renames; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppId(pub u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AppError {
    #[error("application is already running")]
    AlreadyRunning,
    #[error("application is not running")]
    NotRunning,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    NotRunning,
}

impl AppState {
    /// Wire label. A stopping process is still running as far as clients can tell.
    pub fn label(self) -> &'static str {
        match self {
            AppState::NotStarted | AppState::NotRunning => "Not running",
            AppState::Starting => "Starting",
            AppState::Running | AppState::Stopping => "Running",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, AppState::Starting | AppState::Running | AppState::Stopping)
    }
}

// ── Settings ──────────────────────────────────────────────────────────────────

/// The persisted part of an application. Field names follow the wire
/// property names so the same struct serves settings files and imports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    #[serde(rename = "appName")]
    pub name: String,
    pub executable: String,
    pub arguments: String,
    pub directory: String,
    pub launch_at_start: bool,
    pub keep_app_running: bool,
    #[serde(rename = "terminatePrevApp")]
    pub terminate_prev: bool,
    pub soft_terminate: bool,
    pub no_crash_throttle: bool,
    pub lockup_screenshot: bool,
    pub console_capture: bool,
    pub append_capture: bool,
    pub launch_display: String,
    pub launch_delay: i64,
    pub tcp_loopback: bool,
    pub tcp_loopback_port: i64,
    pub heartbeats: bool,
    pub environment: Vec<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            executable: String::new(),
            arguments: String::new(),
            directory: String::new(),
            launch_at_start: false,
            keep_app_running: false,
            terminate_prev: false,
            soft_terminate: false,
            no_crash_throttle: false,
            lockup_screenshot: false,
            console_capture: false,
            append_capture: false,
            launch_display: LAUNCH_DISPLAYS[0].to_string(),
            launch_delay: 0,
            tcp_loopback: false,
            tcp_loopback_port: DEFAULT_LOOPBACK_PORT as i64,
            heartbeats: false,
            environment: Vec::new(),
        }
    }
}

impl AppSettings {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppProperty {
    AppName,
    Executable,
    Arguments,
    Directory,
    LaunchAtStart,
    KeepAppRunning,
    TerminatePrevApp,
    SoftTerminate,
    NoCrashThrottle,
    LockupScreenshot,
    ConsoleCapture,
    AppendCapture,
    LaunchDisplay,
    LaunchDelay,
    TcpLoopback,
    TcpLoopbackPort,
    Heartbeats,
    Environment,
    LastStarted,
    LastExited,
    Restarts,
    State,
    Running,
}

impl AppProperty {
    pub const ALL: [AppProperty; 23] = [
        AppProperty::AppName,
        AppProperty::Executable,
        AppProperty::Arguments,
        AppProperty::Directory,
        AppProperty::LaunchAtStart,
        AppProperty::KeepAppRunning,
        AppProperty::TerminatePrevApp,
        AppProperty::SoftTerminate,
        AppProperty::NoCrashThrottle,
        AppProperty::LockupScreenshot,
        AppProperty::ConsoleCapture,
        AppProperty::AppendCapture,
        AppProperty::LaunchDisplay,
        AppProperty::LaunchDelay,
        AppProperty::TcpLoopback,
        AppProperty::TcpLoopbackPort,
        AppProperty::Heartbeats,
        AppProperty::Environment,
        AppProperty::LastStarted,
        AppProperty::LastExited,
        AppProperty::Restarts,
        AppProperty::State,
        AppProperty::Running,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AppProperty::AppName => "appName",
            AppProperty::Executable => "executable",
            AppProperty::Arguments => "arguments",
            AppProperty::Directory => "directory",
            AppProperty::LaunchAtStart => "launchAtStart",
            AppProperty::KeepAppRunning => "keepAppRunning",
            AppProperty::TerminatePrevApp => "terminatePrevApp",
            AppProperty::SoftTerminate => "softTerminate",
            AppProperty::NoCrashThrottle => "noCrashThrottle",
            AppProperty::LockupScreenshot => "lockupScreenshot",
            AppProperty::ConsoleCapture => "consoleCapture",
            AppProperty::AppendCapture => "appendCapture",
            AppProperty::LaunchDisplay => "launchDisplay",
            AppProperty::LaunchDelay => "launchDelay",
            AppProperty::TcpLoopback => "tcpLoopback",
            AppProperty::TcpLoopbackPort => "tcpLoopbackPort",
            AppProperty::Heartbeats => "heartbeats",
            AppProperty::Environment => "environment",
            AppProperty::LastStarted => "lastStarted",
            AppProperty::LastExited => "lastExited",
            AppProperty::Restarts => "restarts",
            AppProperty::State => "state",
            AppProperty::Running => "running",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            AppProperty::AppName
                | AppProperty::LastStarted
                | AppProperty::LastExited
                | AppProperty::Restarts
                | AppProperty::State
                | AppProperty::Running
        )
    }
}

fn replace<T: PartialEq>(field: &mut T, new: T) -> bool {
    if *field == new {
        return false;
    }
    *field = new;
    true
}

// ── Supervision inputs ────────────────────────────────────────────────────────

/// The global settings that govern every application's supervision.
#[derive(Debug, Clone)]
pub struct SupervisionPolicy {
    pub role: String,
    pub http_port: Option<u16>,
    pub terminate_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub crash_period: Duration,
    pub crash_count: usize,
}

impl Default for SupervisionPolicy {
    fn default() -> Self {
        Self {
            role: String::new(),
            http_port: None,
            terminate_timeout: Duration::from_millis(200),
            heartbeat_timeout: Duration::from_millis(5000),
            crash_period: Duration::from_secs(60),
            crash_count: 10,
        }
    }
}

pub struct LaunchContext<'a> {
    pub data_dir: &'a Path,
    pub events: &'a mpsc::Sender<AgentEvent>,
    pub policy: &'a SupervisionPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Restart,
    Settled,
}

/// A missed heartbeat. When `screenshot` is set the application is paused
/// and waits for `finish_lockup` before it is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lockup {
    pub restart: bool,
    pub screenshot: bool,
}

// ── Application ───────────────────────────────────────────────────────────────

pub struct Application {
    id: AppId,
    settings: AppSettings,
    state: AppState,
    restarts: i64,
    last_started: Option<DateTime<Local>>,
    last_exited: Option<DateTime<Local>>,
    last_exit_code: Option<i32>,
    crashes: CrashCounter,
    generation: u64,
    process: Option<ProcessHandle>,
    channels: Option<AppChannels>,
    pid: Option<u32>,
    last_vars: Vec<String>,
    exit_expected: bool,
    restart_after_exit: bool,
    last_heartbeat: Instant,
    heartbeat_paused: bool,
    bus: Bus,
}

impl Application {
    pub fn new(id: AppId, settings: AppSettings, bus: Bus) -> Self {
        Self {
            id,
            settings,
            state: AppState::NotStarted,
            restarts: 0,
            last_started: None,
            last_exited: None,
            last_exit_code: None,
            crashes: CrashCounter::new(),
            generation: 0,
            process: None,
            channels: None,
            pid: None,
            last_vars: Vec::new(),
            exit_expected: false,
            restart_after_exit: false,
            last_heartbeat: Instant::now(),
            heartbeat_paused: false,
            bus,
        }
    }

    pub fn id(&self) -> AppId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn state(&self) -> AppState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn restarts(&self) -> i64 {
        self.restarts
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        self.last_exit_code
    }

    pub fn last_started(&self) -> Option<&DateTime<Local>> {
        self.last_started.as_ref()
    }

    pub fn last_exited(&self) -> Option<&DateTime<Local>> {
        self.last_exited.as_ref()
    }

    pub fn crash_count(&self) -> usize {
        self.crashes.count()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_active()
    }

    pub fn launch_at_start(&self) -> bool {
        self.settings.launch_at_start
    }

    /// Renames in place. The manager owns name uniqueness and announcements.
    pub fn rename(&mut self, name: &str) {
        self.settings.name = name.to_string();
    }

    fn emit(&self, property: AppProperty) {
        let value = self.value_of(property);
        self.bus.value(GROUP_APP, &self.settings.name, property.name(), value);
    }

    fn set_state(&mut self, state: AppState) {
        let before = (self.state.label(), self.state.is_active());
        self.state = state;
        if before.0 != state.label() {
            self.emit(AppProperty::State);
        }
        if before.1 != state.is_active() {
            self.emit(AppProperty::Running);
        }
    }

    // ── Properties ────────────────────────────────────────────────────────────

    pub fn get(&self, property: &str) -> Result<Value, PropertyError> {
        AppProperty::parse(property)
            .map(|p| self.value_of(p))
            .ok_or_else(|| PropertyError::UnknownProperty(property.to_string()))
    }

    pub fn value_of(&self, property: AppProperty) -> Value {
        let s = &self.settings;
        match property {
            AppProperty::AppName => Value::from(s.name.as_str()),
            AppProperty::Executable => Value::from(s.executable.as_str()),
            AppProperty::Arguments => Value::from(s.arguments.as_str()),
            AppProperty::Directory => Value::from(s.directory.as_str()),
            AppProperty::LaunchAtStart => Value::from(s.launch_at_start),
            AppProperty::KeepAppRunning => Value::from(s.keep_app_running),
            AppProperty::TerminatePrevApp => Value::from(s.terminate_prev),
            AppProperty::SoftTerminate => Value::from(s.soft_terminate),
            AppProperty::NoCrashThrottle => Value::from(s.no_crash_throttle),
            AppProperty::LockupScreenshot => Value::from(s.lockup_screenshot),
            AppProperty::ConsoleCapture => Value::from(s.console_capture),
            AppProperty::AppendCapture => Value::from(s.append_capture),
            AppProperty::LaunchDisplay => Value::from(s.launch_display.as_str()),
            AppProperty::LaunchDelay => Value::from(s.launch_delay),
            AppProperty::TcpLoopback => Value::from(s.tcp_loopback),
            AppProperty::TcpLoopbackPort => Value::from(s.tcp_loopback_port),
            AppProperty::Heartbeats => Value::from(s.heartbeats),
            AppProperty::Environment => string_list(s.environment.iter().cloned()),
            AppProperty::LastStarted => Value::from(format_datetime(self.last_started.as_ref())),
            AppProperty::LastExited => Value::from(format_datetime(self.last_exited.as_ref())),
            AppProperty::Restarts => Value::from(self.restarts),
            AppProperty::State => Value::from(self.state.label()),
            AppProperty::Running => Value::from(self.is_running()),
        }
    }

    /// Type-checks and applies one property. Only an effective change is announced.
    pub fn set(&mut self, property: &str, value: &Value) -> Result<(), PropertyError> {
        let prop = AppProperty::parse(property)
            .ok_or_else(|| PropertyError::UnknownProperty(property.to_string()))?;
        let s = &mut self.settings;
        let changed = match prop {
            AppProperty::Executable => replace(&mut s.executable, expect_string(property, value)?),
            AppProperty::Arguments => replace(&mut s.arguments, expect_string(property, value)?),
            AppProperty::Directory => replace(&mut s.directory, expect_string(property, value)?),
            AppProperty::LaunchAtStart => replace(&mut s.launch_at_start, expect_bool(property, value)?),
            AppProperty::KeepAppRunning => replace(&mut s.keep_app_running, expect_bool(property, value)?),
            AppProperty::TerminatePrevApp => replace(&mut s.terminate_prev, expect_bool(property, value)?),
            AppProperty::SoftTerminate => replace(&mut s.soft_terminate, expect_bool(property, value)?),
            AppProperty::NoCrashThrottle => replace(&mut s.no_crash_throttle, expect_bool(property, value)?),
            AppProperty::LockupScreenshot => replace(&mut s.lockup_screenshot, expect_bool(property, value)?),
            AppProperty::ConsoleCapture => replace(&mut s.console_capture, expect_bool(property, value)?),
            AppProperty::AppendCapture => replace(&mut s.append_capture, expect_bool(property, value)?),
            AppProperty::LaunchDisplay => {
                let display = expect_string(property, value)?;
                if !LAUNCH_DISPLAYS.contains(&display.as_str()) {
                    return Err(PropertyError::InvalidValue {
                        property: property.to_string(),
                        reason: format!("'{display}' is not one of {}", LAUNCH_DISPLAYS.join(", ")),
                    });
                }
                replace(&mut s.launch_display, display)
            }
            AppProperty::LaunchDelay => {
                let delay = expect_in_range(property, expect_int(property, value)?, 0, i64::from(u32::MAX))?;
                replace(&mut s.launch_delay, delay)
            }
            AppProperty::TcpLoopback => replace(&mut s.tcp_loopback, expect_bool(property, value)?),
            AppProperty::TcpLoopbackPort => {
                let port = expect_in_range(property, expect_int(property, value)?, 1, 65535)?;
                replace(&mut s.tcp_loopback_port, port)
            }
            AppProperty::Heartbeats => replace(&mut s.heartbeats, expect_bool(property, value)?),
            AppProperty::Environment => replace(&mut s.environment, expect_string_list(property, value)?),
            AppProperty::AppName
            | AppProperty::LastStarted
            | AppProperty::LastExited
            | AppProperty::Restarts
            | AppProperty::State
            | AppProperty::Running => return Err(PropertyError::ReadOnly(property.to_string())),
        };
        if changed {
            self.emit(prop);
        }
        Ok(())
    }

    /// Replaces every persisted setting except the name, announcing each
    /// property that actually changed.
    pub fn apply_settings(&mut self, mut settings: AppSettings) {
        settings.name = self.settings.name.clone();
        let writable: Vec<AppProperty> = AppProperty::ALL
            .into_iter()
            .filter(|p| !p.is_read_only())
            .collect();
        let before: Vec<Value> = writable.iter().map(|p| self.value_of(*p)).collect();
        self.settings = settings;
        for (prop, old) in writable.into_iter().zip(before) {
            if self.value_of(prop) != old {
                self.emit(prop);
            }
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Launches the application. `vars` are `NAME=VALUE` pairs substituted
    /// into the argument string ahead of the agent's own environment.
    pub fn start(&mut self, vars: &[String], ctx: &LaunchContext<'_>) -> Result<(), AppError> {
        if self.is_running() {
            return Err(AppError::AlreadyRunning);
        }
        let s = &self.settings;
        if s.executable.trim().is_empty() {
            return Err(AppError::InvalidConfig(format!("App {}: no executable set", s.name)));
        }
        let directory = (!s.directory.trim().is_empty()).then(|| PathBuf::from(s.directory.trim()));
        let program = process::resolve_executable(&s.executable, directory.as_deref()).ok_or_else(|| {
            AppError::InvalidConfig(format!("App {}: cannot find executable '{}'", s.name, s.executable))
        })?;

        let env_lookup = |key: &str| std::env::var(key).ok();
        let args = split_args(&substitute_vars(&s.arguments, vars, env_lookup));

        if s.terminate_prev {
            let killed = process::terminate_matching(&program);
            if killed > 0 {
                info!("App {}: terminated {killed} previous instance(s)", s.name);
            }
        }

        let loopback_port = s
            .tcp_loopback
            .then(|| u16::try_from(s.tcp_loopback_port).ok())
            .flatten();
        let channels = AppChannels::open(self.id, &s.name, loopback_port, ctx.events.clone());

        let mut env = vec![
            ("PINHOLEAPPNAME".to_string(), s.name.clone()),
            ("PINHOLEROLE".to_string(), ctx.policy.role.clone()),
            (
                "PINHOLELOGPIPE".to_string(),
                channels
                    .pipe_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
        ];
        if let Some(port) = loopback_port {
            env.push(("PINHOLEAPPPORT".to_string(), port.to_string()));
        }
        if let Some(port) = ctx.policy.http_port {
            env.push(("PINHOLEHTTPPORT".to_string(), port.to_string()));
        }
        env.extend(s.environment.iter().filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), substitute_vars(value, &[], env_lookup)))
        }));

        let capture = s.console_capture.then(|| CaptureSpec {
            path: paths::app_output_path(ctx.data_dir, &s.name),
            append: s.append_capture,
        });

        let spec = LaunchSpec {
            name: s.name.clone(),
            program,
            args,
            directory,
            env,
            delay: Duration::from_millis(s.launch_delay.max(0) as u64),
            capture,
        };

        self.generation += 1;
        self.last_vars = vars.to_vec();
        self.exit_expected = false;
        self.restart_after_exit = false;
        self.heartbeat_paused = false;
        self.last_heartbeat = Instant::now();
        self.channels = Some(channels);
        self.process = Some(process::launch(self.id, self.generation, spec, ctx.events.clone()));
        info!("App {}: starting", self.settings.name);
        self.set_state(AppState::Starting);
        Ok(())
    }

    /// Restarts with the variables of the previous start.
    pub fn restart_after_exit(&mut self, ctx: &LaunchContext<'_>) -> Result<(), AppError> {
        let vars = std::mem::take(&mut self.last_vars);
        self.start(&vars, ctx)
    }

    /// Asks the process to exit: gracefully when `softTerminate` is set,
    /// otherwise at once. The outcome arrives later through `on_exited`.
    pub fn stop(&mut self, restart: bool, policy: &SupervisionPolicy) -> Result<(), AppError> {
        if !self.is_running() {
            return Err(AppError::NotRunning);
        }
        self.exit_expected = true;
        self.restart_after_exit = restart;
        let mode = if self.settings.soft_terminate {
            KillMode::Soft(policy.terminate_timeout)
        } else {
            KillMode::Hard
        };
        info!("App {}: stopping{}", self.settings.name, if restart { " for restart" } else { "" });
        if let Some(process) = &self.process {
            if !process.kill(mode) {
                warn!("App {}: process task already gone", self.settings.name);
            }
        }
        self.set_state(AppState::Stopping);
        Ok(())
    }

    pub fn on_started(&mut self, pid: u32, now: DateTime<Local>) {
        self.pid = Some(pid);
        self.last_started = Some(now);
        self.last_heartbeat = Instant::now();
        info!("App {}: started (pid {pid})", self.settings.name);
        self.emit(AppProperty::LastStarted);
        // A stop issued before the spawn was reported stays in effect.
        if !self.exit_expected {
            self.set_state(AppState::Running);
        }
    }

    pub fn on_start_failed(&mut self, reason: &str) {
        error!("App {}: failed to start: {reason}", self.settings.name);
        self.teardown();
        self.set_state(AppState::NotRunning);
    }

    /// Settles the state after the process is gone and decides whether it
    /// comes back. A crash goes through the crash throttle first.
    pub fn on_exited(&mut self, code: Option<i32>, now: DateTime<Local>, at: Instant, policy: &SupervisionPolicy) -> ExitOutcome {
        self.teardown();
        self.last_exited = Some(now);
        self.last_exit_code = code;
        self.emit(AppProperty::LastExited);
        self.set_state(AppState::NotRunning);

        let code_text = code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string());
        if self.exit_expected {
            self.exit_expected = false;
            info!("App {}: exited (code {code_text})", self.settings.name);
            return if std::mem::take(&mut self.restart_after_exit) {
                ExitOutcome::Restart
            } else {
                ExitOutcome::Settled
            };
        }

        warn!("App {}: exited unexpectedly (code {code_text})", self.settings.name);
        if self.register_crash(at, policy) {
            ExitOutcome::Restart
        } else {
            ExitOutcome::Settled
        }
    }

    /// Records a crash against the throttle. Returns true when the app
    /// should be brought back, having counted the restart.
    fn register_crash(&mut self, at: Instant, policy: &SupervisionPolicy) -> bool {
        if !self.settings.keep_app_running {
            return false;
        }
        if !self.settings.no_crash_throttle {
            let count = self.crashes.record(at, policy.crash_period);
            if count > policy.crash_count {
                self.crashes.reset();
                self.bus.alert(format!(
                    "App {}: Max crashes in period reached, not restarting ({} restarts in {} seconds)",
                    self.settings.name,
                    policy.crash_count,
                    policy.crash_period.as_secs()
                ));
                return false;
            }
        }
        self.restarts += 1;
        self.emit(AppProperty::Restarts);
        true
    }

    fn teardown(&mut self) {
        self.process = None;
        self.pid = None;
        if let Some(mut channels) = self.channels.take() {
            channels.close();
        }
    }

    // ── Heartbeats ────────────────────────────────────────────────────────────

    pub fn heartbeat(&mut self, at: Instant) {
        self.last_heartbeat = at;
    }

    /// Detects a lockup: a running app with heartbeats enabled that has been
    /// silent for longer than the heartbeat timeout.
    pub fn check_heartbeat(&mut self, at: Instant, policy: &SupervisionPolicy) -> Option<Lockup> {
        if self.state != AppState::Running || !self.settings.heartbeats || self.heartbeat_paused {
            return None;
        }
        if at.saturating_duration_since(self.last_heartbeat) < policy.heartbeat_timeout {
            return None;
        }
        warn!(
            "App {}: no heartbeat for {} ms, treating as locked up",
            self.settings.name,
            policy.heartbeat_timeout.as_millis()
        );
        let restart = self.register_crash(at, policy);
        if self.settings.lockup_screenshot {
            self.heartbeat_paused = true;
            return Some(Lockup { restart, screenshot: true });
        }
        let _ = self.stop(restart, policy);
        Some(Lockup { restart, screenshot: false })
    }

    /// Completes a lockup that was waiting on its screenshot.
    pub fn finish_lockup(&mut self, restart: bool, policy: &SupervisionPolicy) {
        self.heartbeat_paused = false;
        if let Err(e) = self.stop(restart, policy) {
            info!("App {}: lockup stop skipped: {e}", self.settings.name);
        }
    }

    /// Handles one line from the log pipe. Every line is a heartbeat.
    pub fn on_log_line(&mut self, line: &str, at: Instant) {
        self.heartbeat(at);
        let name = &self.settings.name;
        match parse_log_line(line) {
            LogMessage::Alert(text) => self.bus.alert(format!("Application {name} alert: {text}")),
            LogMessage::Trigger(events) => self.bus.send(Signal::TriggerEvents(events)),
            LogMessage::Heartbeat => {}
            LogMessage::Log(level, text) => log_at(level, &format!("App {name}: {text}")),
        }
    }

    pub fn on_loopback(&mut self, message: LoopbackMessage, at: Instant) {
        let name = &self.settings.name;
        match message {
            LoopbackMessage::Heartbeat => self.heartbeat(at),
            LoopbackMessage::Error(text) => error!("App {name} [ERR]: {text}"),
            LoopbackMessage::Unknown(tag) => warn!("App {name}: unknown loopback message type {tag:#04x}"),
        }
    }
}

// ── Command line handling ─────────────────────────────────────────────────────

/// Replaces `%NAME%` tokens from `vars` (`NAME=VALUE`) first, then from
/// `lookup`. `%%` is a literal percent; unknown tokens are left as written.
pub fn substitute_vars<F>(text: &str, vars: &[String], lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let find_var = |key: &str| {
        vars.iter()
            .filter_map(|v| v.split_once('='))
            .find(|(k, _)| k.trim() == key)
            .map(|(_, v)| v.to_string())
            .or_else(|| lookup(key))
    };

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(0) => {
                out.push('%');
                rest = &after[1..];
            }
            Some(end) => {
                let key = &after[..end];
                let valid = key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                match valid.then(|| find_var(key)).flatten() {
                    Some(value) => {
                        out.push_str(&value);
                        rest = &after[end + 1..];
                    }
                    None => {
                        // Keep the first '%' and rescan from the second.
                        out.push('%');
                        out.push_str(key);
                        rest = &after[end..];
                    }
                }
            }
            None => {
                out.push('%');
                out.push_str(after);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Splits a command line on whitespace, keeping `"quoted text"` together.
pub fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}
