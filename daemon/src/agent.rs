//! The agent core: one owner for every manager and the dispatcher, driven by
//! a single event loop. Background tasks only ever talk to it through
//! `AgentEvent`s; managers talk back through the signal bus.

use chrono::{DateTime, Local, Timelike};
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, sleep, timeout_at, Instant, Interval, MissedTickBehavior};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::bus::{Signal, ValueChange};
use crate::commands::Managers;
use crate::config::Config;
use crate::dispatcher::{Control, Dispatcher, InternalShot};
use crate::event::AgentEvent;
use crate::global_manager::{power_off, PROP_BACKEND_SERVER, PROP_HOST_LOG_LEVEL, PROP_REMOTE_LOG_LEVEL};
use crate::logging::{LoggingHandle, RemoteLogEntry};
use crate::property::GROUP_GLOBAL;
use crate::proxy_link::ProxyLink;
use crate::resource_monitor::{ResourceMonitor, ResourceSample};
use crate::settings::write_settings;
use crate::watchdog::Watchdog;

/// Heartbeat lockups and deferred-response deadlines are checked this often.
const HEARTBEAT_TICK: Duration = Duration::from_millis(50);
const WATCHDOG_FEED: Duration = Duration::from_secs(1);
const RESOURCE_CHECK: Duration = Duration::from_secs(100);
/// Extra time children get to exit on shutdown, on top of the terminate timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Everything the agent is assembled from.
pub struct AgentParts {
    pub managers: Managers,
    pub dispatcher: Dispatcher,
    /// `None` when no subscriber was installed (tests).
    pub logging: Option<LoggingHandle>,
    pub config: Config,
    pub settings_path: PathBuf,
    pub connector: TlsConnector,
    pub events_tx: mpsc::Sender<AgentEvent>,
    pub events: mpsc::Receiver<AgentEvent>,
    pub signals: mpsc::UnboundedReceiver<Signal>,
    pub remote_logs: mpsc::UnboundedReceiver<RemoteLogEntry>,
    pub watchdog: Option<Watchdog>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Reconfigured,
    Stop,
}

pub struct Agent {
    managers: Managers,
    dispatcher: Dispatcher,
    logging: Option<LoggingHandle>,
    config: Config,
    settings_path: PathBuf,
    connector: TlsConnector,
    events_tx: mpsc::Sender<AgentEvent>,
    events: mpsc::Receiver<AgentEvent>,
    signals: mpsc::UnboundedReceiver<Signal>,
    remote_logs: mpsc::UnboundedReceiver<RemoteLogEntry>,
    watchdog: Option<Watchdog>,
    proxy: Option<ProxyLink>,
    resources: ResourceMonitor,
    system: System,
}

/// Time until the next wall-clock minute boundary.
fn until_next_minute() -> Duration {
    let now = Local::now();
    let into_minute = Duration::new(u64::from(now.second()), now.nanosecond().min(999_999_999));
    Duration::from_secs(60).saturating_sub(into_minute)
}

/// Records the wall-clock minute `now` falls in. False when that minute was
/// already seen, which happens when the timer wakes just before a boundary.
fn enter_minute(last: &mut Option<i64>, now: &DateTime<Local>) -> bool {
    let minute = now.timestamp().div_euclid(60);
    if *last == Some(minute) {
        return false;
    }
    *last = Some(minute);
    true
}

fn autosave_timer(config: &Config) -> Interval {
    let period = config.server.autosave_interval();
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

impl Agent {
    pub fn new(parts: AgentParts) -> Self {
        let mut agent = Self {
            managers: parts.managers,
            dispatcher: parts.dispatcher,
            logging: parts.logging,
            config: parts.config,
            settings_path: parts.settings_path,
            connector: parts.connector,
            events_tx: parts.events_tx,
            events: parts.events,
            signals: parts.signals,
            remote_logs: parts.remote_logs,
            watchdog: parts.watchdog,
            proxy: None,
            resources: ResourceMonitor::new(),
            system: System::new(),
        };
        let policy = agent.managers.globals.settings().policy();
        agent.managers.apps.set_policy(policy);
        agent.restart_proxy();
        agent
    }

    /// Launches `launchAtStart` applications and the members of startup groups.
    pub fn start_startup(&mut self) {
        self.managers.apps.start_startup_apps();
        self.managers.start_startup_groups();
        self.drain_signals();
    }

    pub async fn run(mut self) {
        let mut heartbeat = interval(HEARTBEAT_TICK);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Re-armed from the wall clock on every tick so clock steps and drift
        // cannot skip or repeat a schedule minute.
        let minute = sleep(until_next_minute());
        tokio::pin!(minute);
        let mut last_minute = None;
        let mut autosave = autosave_timer(&self.config);
        let mut feed = interval(WATCHDOG_FEED);
        let mut resources = interval(RESOURCE_CHECK);
        resources.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    match self.handle_event(event) {
                        Flow::Continue => {}
                        Flow::Reconfigured => autosave = autosave_timer(&self.config),
                        Flow::Stop => break,
                    }
                }
                Some(entry) = self.remote_logs.recv() => self.forward_log(entry),
                _ = heartbeat.tick() => {
                    let now = std::time::Instant::now();
                    self.managers.apps.check_heartbeats(now);
                    self.dispatcher.expire_waiters(now);
                }
                _ = &mut minute => {
                    let now = Local::now();
                    if enter_minute(&mut last_minute, &now) {
                        self.managers.schedule.tick(now);
                    }
                    minute.as_mut().reset(Instant::now() + until_next_minute());
                }
                _ = autosave.tick() => {
                    self.save();
                }
                _ = feed.tick() => {
                    if let Some(watchdog) = &self.watchdog {
                        watchdog.feed();
                    }
                }
                _ = resources.tick() => self.check_resources(),
            }
            self.drain_signals();
            self.finish_screenshots();
        }

        self.shutdown().await;
    }

    fn handle_event(&mut self, event: AgentEvent) -> Flow {
        match event {
            AgentEvent::SessionOpened { key, id, local, outbound } => {
                self.dispatcher.open_session(key, id, local, outbound);
            }
            AgentEvent::Frame { key, payload } => {
                let now = std::time::Instant::now();
                match self.dispatcher.handle_frame(key, &payload, &mut self.managers, now) {
                    Control::Continue => {}
                    Control::Disconnect => self.dispatcher.disconnect(key),
                    Control::Shutdown => return Flow::Stop,
                }
            }
            AgentEvent::SessionClosed { key } => self.dispatcher.close_session(key),
            AgentEvent::Process { app, generation, event } => {
                self.managers.apps.on_process_event(app, generation, event);
            }
            AgentEvent::AppLog { app, line } => self.managers.apps.on_app_log(app, &line),
            AgentEvent::Loopback { app, message } => self.managers.apps.on_loopback(app, message),
            AgentEvent::ConfigReloaded(config) => {
                info!("Config reloaded");
                self.dispatcher.set_deferred_timeout(config.server.deferred_timeout());
                let port_changed = config.server.backend_port != self.config.server.backend_port;
                self.config = config;
                if port_changed {
                    if let Some(link) = self.proxy.take() {
                        let _ = link.stop();
                    }
                    self.restart_proxy();
                }
                return Flow::Reconfigured;
            }
            AgentEvent::Shutdown => return Flow::Stop,
        }
        Flow::Continue
    }

    /// Handles every signal the managers raised, including the ones raised
    /// while handling earlier signals.
    fn drain_signals(&mut self) {
        while let Ok(signal) = self.signals.try_recv() {
            self.handle_signal(signal);
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        let m = &mut self.managers;
        match signal {
            Signal::Value(change) => {
                self.dispatcher.publish_value(&change);
                if change.group == GROUP_GLOBAL {
                    self.global_changed(&change);
                }
            }
            Signal::Alert(text) => m.alerts.generate_alert(&text, Local::now()),
            Signal::TriggerEvents(names) => {
                m.schedule.trigger_events(&names, Local::now());
            }
            Signal::StartApps(names) => {
                m.apps.start_apps(&names);
            }
            Signal::StopApps(names) => {
                m.apps.stop_apps(&names);
            }
            Signal::RestartApps(names) => {
                m.apps.restart_apps(&names);
            }
            Signal::StartGroup(name) => {
                m.start_group(&name);
            }
            Signal::StopGroup(name) => {
                m.stop_group(&name);
            }
            Signal::Screenshot(path) => {
                let shot = InternalShot { path, lockup: None };
                if !self.dispatcher.request_screenshot(shot, std::time::Instant::now()) {
                    warn!("Screenshot requested but no helper is connected");
                }
            }
            Signal::LockupScreenshot { app, restart, path } => {
                let shot = InternalShot {
                    path,
                    lockup: Some((app, restart)),
                };
                if !self.dispatcher.request_screenshot(shot, std::time::Instant::now()) {
                    debug!("no helper for the lockup screenshot");
                    m.apps.finish_lockup(app, restart);
                }
            }
            Signal::AppRenamed { from, to } => m.groups.app_renamed(&from, &to),
            Signal::AppDeleted(name) => m.groups.app_deleted(&name),
            Signal::Shutdown => {
                power_off(false);
            }
            Signal::Reboot => {
                power_off(true);
            }
        }
    }

    fn global_changed(&mut self, change: &ValueChange) {
        let settings = self.managers.globals.settings();
        match change.property.as_str() {
            PROP_HOST_LOG_LEVEL => {
                if let Some(logging) = &self.logging {
                    logging.set_level(settings.host_log_level());
                }
            }
            PROP_REMOTE_LOG_LEVEL => {}
            PROP_BACKEND_SERVER => self.restart_proxy(),
            _ => {
                let policy = settings.policy();
                self.managers.apps.set_policy(policy);
            }
        }
    }

    /// Brings the proxy link in line with `backendServer`.
    fn restart_proxy(&mut self) {
        let server = self.managers.globals.settings().backend_server.trim().to_string();
        if self.proxy.as_ref().map(ProxyLink::server) == Some(server.as_str()) {
            return;
        }
        if let Some(link) = self.proxy.take() {
            info!("Disconnecting from backend {}", link.server());
            let _ = link.stop();
        }
        if !server.is_empty() {
            self.proxy = Some(ProxyLink::start(
                server,
                self.config.server.backend_port,
                self.connector.clone(),
                self.events_tx.clone(),
            ));
        }
    }

    fn forward_log(&mut self, entry: RemoteLogEntry) {
        if entry.level >= self.managers.globals.settings().remote_log_level() {
            self.dispatcher.publish_log(entry.level, &entry.message);
        }
    }

    fn check_resources(&mut self) {
        let sample = ResourceSample::collect(&mut self.system);
        let alerts = self.resources.check(self.managers.globals.settings(), &sample);
        for text in alerts {
            self.managers.alerts.generate_alert(&text, Local::now());
        }
    }

    /// Writes images for the agent's own screenshot requests and finishes
    /// any lockup that was waiting on one.
    fn finish_screenshots(&mut self) {
        for (shot, image) in self.dispatcher.take_internal_completions() {
            if let Some(image) = image {
                let written = shot
                    .path
                    .parent()
                    .map_or(Ok(()), std::fs::create_dir_all)
                    .and_then(|()| std::fs::write(&shot.path, &image));
                match written {
                    Ok(()) => info!("Screenshot saved to {}", shot.path.display()),
                    Err(e) => warn!("failed to write screenshot {}: {e}", shot.path.display()),
                }
            }
            if let Some((app, restart)) = shot.lockup {
                self.managers.apps.finish_lockup(app, restart);
            }
        }
    }

    fn save(&self) -> bool {
        let mut state = self.managers.persisted();
        let password = self.dispatcher.password();
        state.salt = password.salt.clone();
        state.hash = password.hash.clone();
        state.server_id = self.dispatcher.server_id().to_string();
        write_settings(&self.settings_path, &state)
    }

    async fn shutdown(mut self) {
        info!("Shutting down with {} session(s) open", self.dispatcher.session_count());
        self.managers.apps.stop_all_apps();

        // Let the process tasks report their exits so nothing is left behind.
        let deadline = Instant::now() + self.managers.apps.policy().terminate_timeout + SHUTDOWN_GRACE;
        while self.managers.apps.running_count() > 0 {
            match timeout_at(deadline, self.events.recv()).await {
                Ok(Some(AgentEvent::Process { app, generation, event })) => {
                    self.managers.apps.on_process_event(app, generation, event);
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    warn!("{} application(s) still running at exit", self.managers.apps.running_count());
                    break;
                }
            }
        }

        self.save();
        self.dispatcher.close_all();
        if let Some(link) = self.proxy.take() {
            let _ = link.stop().await;
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert_manager::AlertManager;
    use crate::app_manager::AppManager;
    use crate::bus::Bus;
    use crate::cert::{client_config, generate_self_signed, TlsMaterial};
    use crate::dispatcher::{Outbound, SessionKey};
    use crate::global_manager::{GlobalManager, GlobalSettings};
    use crate::group_manager::GroupManager;
    use crate::logging::LogLevel;
    use crate::protocol::{decode_message, encode_message};
    use crate::schedule::ScheduleManager;
    use crate::secret::{LocalSecret, PasswordHash};
    use crate::settings::load_settings;
    use rmpv::Value;
    use tokio::task::JoinHandle;

    struct Fixture {
        events: mpsc::Sender<AgentEvent>,
        bus: Bus,
        remote_logs: mpsc::UnboundedSender<RemoteLogEntry>,
        secret: LocalSecret,
        settings_path: PathBuf,
        agent: JoinHandle<()>,
        dir: tempfile::TempDir,
    }

    fn start_agent() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_path_buf();
        let (bus, signals) = Bus::new();
        let (events_tx, events) = mpsc::channel(64);
        let (remote_tx, remote_logs) = mpsc::unbounded_channel();
        let secret = LocalSecret::generate(&data_dir.join("local.secret")).unwrap();
        let (cert, key) = generate_self_signed("localhost").unwrap();
        let material = TlsMaterial::from_pem(cert.as_bytes(), key.as_bytes()).unwrap();
        let settings_path = data_dir.join("settings.toml");

        let managers = Managers {
            apps: AppManager::new(bus.clone(), data_dir.clone(), events_tx.clone()),
            groups: GroupManager::new(bus.clone()),
            globals: GlobalManager::new(GlobalSettings::default(), bus.clone()),
            alerts: AlertManager::new(&data_dir, bus.clone()),
            schedule: ScheduleManager::new(&data_dir, bus.clone()),
            data_dir: data_dir.clone(),
            log_dir: data_dir.join("logs"),
        };
        let dispatcher = Dispatcher::new(
            PasswordHash::for_password("pw"),
            secret.clone(),
            "sid".to_string(),
            "agent-host".to_string(),
            Duration::from_secs(30),
        );
        let agent = Agent::new(AgentParts {
            managers,
            dispatcher,
            logging: None,
            config: Config::default(),
            settings_path: settings_path.clone(),
            connector: TlsConnector::from(client_config(&material).unwrap()),
            events_tx: events_tx.clone(),
            events,
            signals,
            remote_logs,
            watchdog: None,
        });
        Fixture {
            events: events_tx,
            bus,
            remote_logs: remote_tx,
            secret,
            settings_path,
            agent: tokio::spawn(agent.run()),
            dir,
        }
    }

    struct Client {
        key: SessionKey,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    impl Fixture {
        async fn connect(&self, password: &str, helper: bool) -> Client {
            let key = SessionKey::next();
            let (outbound, rx) = mpsc::unbounded_channel();
            self.events
                .send(AgentEvent::SessionOpened {
                    key,
                    id: format!("TCP:10.1.1.1:{}", key.0),
                    local: false,
                    outbound,
                })
                .await
                .unwrap();
            let mut client = Client { key, rx };
            self.send(&client, vec!["aut".into(), "1".into(), "test".into(), password.into(), helper.into()])
                .await;
            assert_eq!(client.recv().await.unwrap()[1], Value::from(1));
            client
        }

        async fn send(&self, client: &Client, items: Vec<Value>) {
            self.events
                .send(AgentEvent::Frame {
                    key: client.key,
                    payload: encode_message(items),
                })
                .await
                .unwrap();
        }
    }

    impl Fixture {
        /// Round-trips a query so every frame sent before it has been handled.
        async fn sync(&self, client: &mut Client) {
            self.send(client, vec!["qry".into(), "glo".into(), "".into(), "role".into()])
                .await;
            assert_eq!(client.recv().await.unwrap()[0], Value::from("val"));
        }
    }

    impl Client {
        /// Next frame, or `None` once the agent asked to close the session.
        async fn recv(&mut self) -> Option<Vec<Value>> {
            let next = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("no frame from the agent");
            match next? {
                Outbound::Frame(bytes) => Some(decode_message(&bytes).unwrap()),
                Outbound::Close => None,
            }
        }
    }

    // ── sessions ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn query_and_terminate() {
        let f = start_agent();
        let mut client = f.connect("pw", false).await;

        f.send(&client, vec!["qry".into(), "app".into(), "".into(), "appList".into()])
            .await;
        let reply = client.recv().await.unwrap();
        assert_eq!(reply[0], Value::from("val"));
        assert_eq!(reply[4], Value::Array(vec![]));

        f.send(&client, vec!["xxx".into()]).await;
        assert_eq!(client.recv().await.unwrap()[0], Value::from("rsp"));
        tokio::time::timeout(Duration::from_secs(10), f.agent).await.unwrap().unwrap();
        assert!(client.recv().await.is_none());

        let saved = load_settings(&f.settings_path).unwrap();
        assert_eq!(saved.server_id, "sid");
        assert!(!saved.hash.is_empty());
    }

    #[tokio::test]
    async fn bad_packet_disconnects_only_that_session() {
        let f = start_agent();
        let mut bad = f.connect("pw", false).await;
        let mut good = f.connect("pw", false).await;

        f.send(&bad, vec!["qry".into(), 1.into()]).await;
        assert!(bad.recv().await.is_none());

        f.send(&good, vec!["qry".into(), "glo".into(), "".into(), "role".into()])
            .await;
        assert_eq!(good.recv().await.unwrap()[0], Value::from("val"));
        f.events.send(AgentEvent::Shutdown).await.unwrap();
    }

    // ── signals ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn bus_alerts_reach_subscribers() {
        let f = start_agent();
        let mut client = f.connect("pw", false).await;
        f.send(&client, vec!["sub".into(), "val".into()]).await;
        f.send(&client, vec!["grp".into(), "alr".into()]).await;
        f.sync(&mut client).await;

        f.bus.alert("disk on fire");

        let frame = client.recv().await.unwrap();
        assert_eq!(
            frame,
            vec![
                Value::from("val"),
                Value::from("alr"),
                Value::from(""),
                Value::from("alertCount"),
                Value::from(1),
            ]
        );
        f.events.send(AgentEvent::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn internal_screenshot_is_written_to_disk() {
        let f = start_agent();
        let secret = f.secret.as_str().to_string();
        let mut helper = f.connect(&secret, true).await;
        let path = f.dir.path().join("shots").join("Scheduled.png");

        f.bus.send(Signal::Screenshot(path.clone()));
        f.send(&helper, vec!["nop".into()]).await;
        assert_eq!(helper.recv().await.unwrap(), vec![Value::from("scr")]);

        f.send(&helper, vec!["scr".into(), Value::Binary(b"PNG".to_vec())]).await;
        f.send(&helper, vec!["nop".into()]).await;
        f.events.send(AgentEvent::Shutdown).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), f.agent).await.unwrap().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"PNG");
    }

    #[tokio::test]
    async fn remote_log_respects_level() {
        let f = start_agent();
        let mut client = f.connect("pw", false).await;
        f.send(&client, vec!["sub".into(), "log".into()]).await;
        f.sync(&mut client).await;

        f.remote_logs
            .send(RemoteLogEntry {
                level: LogLevel::Debug,
                message: "chatter".to_string(),
            })
            .unwrap();
        f.remote_logs
            .send(RemoteLogEntry {
                level: LogLevel::Warning,
                message: "careful".to_string(),
            })
            .unwrap();

        let frame = client.recv().await.unwrap();
        assert_eq!(
            frame,
            vec![Value::from("log"), Value::from(4), Value::from("careful")]
        );
        f.events.send(AgentEvent::Shutdown).await.unwrap();
    }

    #[test]
    fn next_minute_is_within_a_minute() {
        let d = until_next_minute();
        assert!(d > Duration::ZERO && d <= Duration::from_secs(60));
    }

    #[test]
    fn each_wall_clock_minute_is_entered_once() {
        use chrono::TimeZone;
        let at = |m: u32, s: u32| Local.with_ymd_and_hms(2024, 6, 12, 10, m, s).unwrap();
        let mut last = None;
        assert!(enter_minute(&mut last, &at(0, 0)));
        assert!(!enter_minute(&mut last, &at(0, 59)));
        assert!(enter_minute(&mut last, &at(1, 0)));
        // A forward step lands on a later minute and still fires.
        assert!(enter_minute(&mut last, &at(5, 2)));
        // A backward step into an earlier minute fires that minute again.
        assert!(enter_minute(&mut last, &at(4, 30)));
    }
}
