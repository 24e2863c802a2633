//! Session authentication and routing of protocol messages.
//!
//! The dispatcher owns every session's bookkeeping (auth state, subscriptions,
//! outbound channel) and the deferred screenshot waiters. Business state lives
//! behind [`CommandTarget`]; the dispatcher only parses, routes and answers.

use bytes::Bytes;
use futures::future::BoxFuture;
use rmpv::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::application::AppId;
use crate::bus::ValueChange;
use crate::logging::{log_at, LogLevel};
use crate::property::GROUP_NONE;
use crate::protocol::{
    decode_message, encode_message, ArgParser, ProtocolError, ResponseCode, CMD_AUTH, CMD_COMMAND, CMD_LOG,
    CMD_MISSING, CMD_NOOP, CMD_QUERY, CMD_RESPONSE, CMD_SCREENSHOT, CMD_SHOW_SCREEN_IDS, CMD_SUBSCRIBE_CMD,
    CMD_SUBSCRIBE_GROUP, CMD_TERMINATE, CMD_UNKNOWN, CMD_VALUE, CMD_VALUE_SET,
};
use crate::secret::{LocalSecret, PasswordHash};

pub const CMD_SET_PASSWORD: &str = "setPassword";
pub const CMD_GET_SCREENSHOT: &str = "getScreenshot";
pub const CMD_SHOW_SCREEN_IDS_SUB: &str = "showScreenIds";
pub const CMD_LOG_MESSAGE: &str = "logMessage";

/// Arguments of `cmd` start after the command tag, group and sub-command.
pub const COMMAND_ARG_OFFSET: usize = 3;
/// Wrong passwords a normal session may send before it is dropped.
const MAX_AUTH_FAILURES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionKey(pub u64);

impl SessionKey {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// What a session task is asked to do with its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// One encoded message; the session adds its own framing.
    Frame(Bytes),
    Close,
}

/// What the caller must do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Disconnect,
    Shutdown,
}

/// Result of a `cmd` handled by the business side.
pub enum CommandOutcome {
    Success,
    Failed,
    Data(Value),
    Unknown,
    /// Completes later; `Ok(None)` is success and `Ok(Some(v))` carries data.
    Pending(BoxFuture<'static, anyhow::Result<Option<Value>>>),
}

impl From<bool> for CommandOutcome {
    fn from(ok: bool) -> Self {
        if ok {
            CommandOutcome::Success
        } else {
            CommandOutcome::Failed
        }
    }
}

impl std::fmt::Debug for CommandOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandOutcome::Success => f.write_str("Success"),
            CommandOutcome::Failed => f.write_str("Failed"),
            CommandOutcome::Data(v) => f.debug_tuple("Data").field(v).finish(),
            CommandOutcome::Unknown => f.write_str("Unknown"),
            CommandOutcome::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

/// The calling session and the raw `cmd` message.
pub struct CommandContext<'a> {
    pub client: &'a str,
    pub host_name: &'a str,
    pub items: &'a [Value],
}

impl<'a> CommandContext<'a> {
    pub fn args(&self, sub_command: &'a str) -> ArgParser<'a> {
        ArgParser::new(sub_command, self.client, self.items, COMMAND_ARG_OFFSET)
    }
}

/// The managers as seen from the protocol.
pub trait CommandTarget {
    /// Current value, or `None` when the group, item or property does not exist.
    fn query(&self, group: &str, item: &str, property: &str) -> Option<Value>;
    fn set_value(&mut self, group: &str, item: &str, property: &str, value: &Value) -> bool;
    fn command(&mut self, ctx: &CommandContext<'_>, group: &str, sub: &str) -> Result<CommandOutcome, ProtocolError>;
}

// ── Screenshot waiters ────────────────────────────────────────────────────────

/// A screenshot the agent itself asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalShot {
    pub path: PathBuf,
    /// Set for a lockup: the app to stop afterwards, and whether to restart it.
    pub lockup: Option<(AppId, bool)>,
}

#[derive(Debug)]
enum WaiterTarget {
    Session { key: SessionKey, group: String, sub: String },
    Internal(InternalShot),
}

#[derive(Debug)]
struct Waiter {
    target: WaiterTarget,
    deadline: Instant,
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Session {
    id: String,
    local: bool,
    outbound: mpsc::UnboundedSender<Outbound>,
    authenticated: bool,
    auth_failures: u32,
    version: String,
    host_name: String,
    helper: bool,
    special: bool,
    commands: HashSet<String>,
    groups: HashSet<String>,
}

impl Session {
    fn send(&self, items: Vec<Value>) {
        let _ = self.outbound.send(Outbound::Frame(encode_message(items)));
    }

    fn display_name(&self) -> String {
        if self.helper {
            "TrayIcon".to_string()
        } else {
            format!("{}:{}", self.id, self.host_name)
        }
    }
}

enum Own {
    Done(CommandOutcome),
    Deferred,
    /// Not a session-level command; the managers handle it.
    Delegate,
}

fn response(group: &str, sub: &str, code: ResponseCode) -> Vec<Value> {
    vec![CMD_RESPONSE.into(), group.into(), sub.into(), code.into()]
}

fn data_response(group: &str, sub: &str, data: Value) -> Vec<Value> {
    let mut items = response(group, sub, ResponseCode::Data);
    items.push(data);
    items
}

pub struct Dispatcher {
    sessions: BTreeMap<SessionKey, Session>,
    password: PasswordHash,
    local_secret: LocalSecret,
    server_id: String,
    host_name: String,
    deferred_timeout: Duration,
    waiters: Vec<Waiter>,
    completions: Vec<(InternalShot, Option<Vec<u8>>)>,
}

impl Dispatcher {
    pub fn new(
        password: PasswordHash,
        local_secret: LocalSecret,
        server_id: String,
        host_name: String,
        deferred_timeout: Duration,
    ) -> Self {
        Self {
            sessions: BTreeMap::new(),
            password,
            local_secret,
            server_id,
            host_name,
            deferred_timeout,
            waiters: Vec::new(),
            completions: Vec::new(),
        }
    }

    pub fn password(&self) -> &PasswordHash {
        &self.password
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn set_deferred_timeout(&mut self, timeout: Duration) {
        self.deferred_timeout = timeout;
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn helper_connected(&self) -> bool {
        self.helper().is_some()
    }

    fn helper(&self) -> Option<&Session> {
        self.sessions.values().find(|s| s.authenticated && s.helper)
    }

    fn send_to_helper(&self, items: Vec<Value>) -> bool {
        match self.helper() {
            Some(helper) => {
                helper.send(items);
                true
            }
            None => false,
        }
    }

    pub fn open_session(&mut self, key: SessionKey, id: String, local: bool, outbound: mpsc::UnboundedSender<Outbound>) {
        debug!("session {id} opened");
        self.sessions.insert(
            key,
            Session {
                id,
                local,
                outbound,
                authenticated: false,
                auth_failures: 0,
                version: String::new(),
                host_name: String::new(),
                helper: false,
                special: false,
                commands: HashSet::new(),
                groups: HashSet::new(),
            },
        );
    }

    pub fn close_session(&mut self, key: SessionKey) {
        let Some(session) = self.sessions.remove(&key) else {
            return;
        };
        debug!("session {} closed", session.id);
        self.waiters
            .retain(|w| !matches!(&w.target, WaiterTarget::Session { key: k, .. } if *k == key));

        if session.authenticated && session.helper && !self.helper_connected() && !self.waiters.is_empty() {
            warn!("helper disconnected with {} screenshot request(s) outstanding", self.waiters.len());
            for waiter in std::mem::take(&mut self.waiters) {
                self.fail_waiter(waiter);
            }
        }
    }

    /// Asks one session task to close its stream. The session stays
    /// registered until its task reports `SessionClosed`.
    pub fn disconnect(&mut self, key: SessionKey) {
        if let Some(session) = self.sessions.get(&key) {
            let _ = session.outbound.send(Outbound::Close);
        }
    }

    /// Asks every live session task to close its stream.
    pub fn close_all(&mut self) {
        for session in self.sessions.values() {
            let _ = session.outbound.send(Outbound::Close);
        }
    }

    // ── Frame handling ────────────────────────────────────────────────────────

    pub fn handle_frame(
        &mut self,
        key: SessionKey,
        payload: &[u8],
        target: &mut dyn CommandTarget,
        now: Instant,
    ) -> Control {
        let Some(client) = self.sessions.get(&key).map(|s| s.id.clone()) else {
            return Control::Disconnect;
        };
        let items = match decode_message(payload) {
            Ok(items) => items,
            Err(e) => {
                error!("client {client}: {e}");
                return Control::Disconnect;
            }
        };
        let command = items[0].as_str().unwrap_or_default().to_string();

        if command == CMD_NOOP {
            return Control::Continue;
        }

        let authenticated = self.sessions.get(&key).map(|s| s.authenticated).unwrap_or(false);
        let result = if !authenticated {
            self.handle_auth(key, &client, &command, &items)
        } else {
            self.handle_command(key, &client, &command, &items, target, now)
        };
        match result {
            Ok(control) => control,
            Err(e) => {
                error!("{e}");
                Control::Disconnect
            }
        }
    }

    fn handle_auth(
        &mut self,
        key: SessionKey,
        client: &str,
        command: &str,
        items: &[Value],
    ) -> Result<Control, ProtocolError> {
        let auth_error = || vec![CMD_AUTH.into(), 0.into(), "Error".into()];
        let Some(session) = self.sessions.get_mut(&key) else {
            return Ok(Control::Disconnect);
        };
        if command != CMD_AUTH || items.len() < 5 {
            warn!(
                "Bad authentication packet from client {client} command '{command}' size {}",
                items.len()
            );
            session.send(auth_error());
            return Ok(Control::Disconnect);
        }

        let mut args = ArgParser::new(CMD_AUTH, client, items, 1);
        let parsed = (|| Ok::<_, ProtocolError>((args.string()?, args.string()?, args.string()?, args.bool()?)))();
        let (version, host_name, password, helper) = match parsed {
            Ok(fields) => fields,
            Err(e) => {
                error!("{e}");
                session.send(auth_error());
                return Ok(Control::Disconnect);
            }
        };

        let by_secret = self.local_secret.matches(&password);
        let by_password = self.password.verify(&password);
        if !by_secret && !by_password {
            session.auth_failures += 1;
            warn!("Authentication failed from client {client}");
            session.send(vec![CMD_AUTH.into(), 0.into(), "Password error".into()]);
            if session.local || helper || session.auth_failures >= MAX_AUTH_FAILURES {
                return Ok(Control::Disconnect);
            }
            return Ok(Control::Continue);
        }

        session.authenticated = true;
        session.version = version;
        session.host_name = host_name;
        session.helper = helper;
        session.special = self.password.is_set() && by_password;
        debug!(
            "Client connection: {client} v{} hostname:{} helper:{} special:{}",
            session.version, session.host_name, session.helper, session.special
        );
        session.send(vec![
            CMD_AUTH.into(),
            1.into(),
            self.host_name.as_str().into(),
            env!("CARGO_PKG_VERSION").into(),
            self.server_id.as_str().into(),
        ]);
        Ok(Control::Continue)
    }

    fn handle_command(
        &mut self,
        key: SessionKey,
        client: &str,
        command: &str,
        items: &[Value],
        target: &mut dyn CommandTarget,
        now: Instant,
    ) -> Result<Control, ProtocolError> {
        let reply = match command {
            CMD_TERMINATE => {
                self.send_to_helper(vec![CMD_TERMINATE.into()]);
                let host = self.sessions.get(&key).map(|s| s.host_name.clone()).unwrap_or_default();
                info!("Termination requested by {client} {host}");
                self.send(key, response("", "", ResponseCode::Success));
                return Ok(Control::Shutdown);
            }
            CMD_SUBSCRIBE_CMD => {
                let sub = ArgParser::new(command, client, items, 1).string()?;
                if let Some(session) = self.sessions.get_mut(&key) {
                    session.commands.insert(sub);
                }
                None
            }
            CMD_SUBSCRIBE_GROUP => {
                let group = ArgParser::new(command, client, items, 1).string()?;
                if let Some(session) = self.sessions.get_mut(&key) {
                    session.groups.insert(group);
                }
                None
            }
            CMD_QUERY => {
                let mut args = ArgParser::new(command, client, items, 1);
                let (group, item, property) = (args.string()?, args.string()?, args.string()?);
                Some(match target.query(&group, &item, &property) {
                    Some(value) => vec![CMD_VALUE.into(), group.into(), item.into(), property.into(), value],
                    None => vec![CMD_MISSING.into(), group.into(), item.into(), property.into()],
                })
            }
            CMD_VALUE => {
                let mut args = ArgParser::new(command, client, items, 1);
                let (group, item, property, value) = (args.string()?, args.string()?, args.string()?, args.value()?);
                let ok = target.set_value(&group, &item, &property, &value);
                Some(vec![
                    CMD_VALUE_SET.into(),
                    group.into(),
                    item.into(),
                    property.into(),
                    ok.into(),
                ])
            }
            CMD_COMMAND => self.handle_cmd(key, client, items, target, now)?,
            CMD_SCREENSHOT => {
                let image = ArgParser::new(command, client, items, 1).bytes()?;
                if self.sessions.get(&key).is_some_and(|s| s.helper) {
                    debug!("Screen shot size {}", image.len());
                    self.complete_screenshot(image);
                } else {
                    warn!("Ignoring screenshot from non-helper client {client}");
                }
                None
            }
            _ => Some(vec![CMD_UNKNOWN.into(), command.into()]),
        };
        if let Some(items) = reply {
            self.send(key, items);
        }
        Ok(Control::Continue)
    }

    fn handle_cmd(
        &mut self,
        key: SessionKey,
        client: &str,
        items: &[Value],
        target: &mut dyn CommandTarget,
        now: Instant,
    ) -> Result<Option<Vec<Value>>, ProtocolError> {
        let mut args = ArgParser::new(CMD_COMMAND, client, items, 1);
        let (group, sub) = (args.string()?, args.string()?);
        debug!("Command {group} {sub}");

        let own = if group == GROUP_NONE {
            self.handle_own_command(key, client, &sub, items, now)?
        } else {
            Own::Delegate
        };
        let outcome = match own {
            Own::Done(outcome) => outcome,
            Own::Deferred => return Ok(None),
            Own::Delegate => {
                let host_name = self.sessions.get(&key).map(|s| s.host_name.clone()).unwrap_or_default();
                let ctx = CommandContext {
                    client,
                    host_name: &host_name,
                    items,
                };
                target.command(&ctx, &group, &sub)?
            }
        };

        Ok(match outcome {
            CommandOutcome::Success => Some(response(&group, &sub, ResponseCode::Success)),
            CommandOutcome::Failed => Some(response(&group, &sub, ResponseCode::Error)),
            CommandOutcome::Unknown => Some(response(&group, &sub, ResponseCode::Unknown)),
            CommandOutcome::Data(value) => Some(data_response(&group, &sub, value)),
            CommandOutcome::Pending(future) => {
                if let Some(session) = self.sessions.get(&key) {
                    let outbound = session.outbound.clone();
                    tokio::spawn(async move {
                        let items = match future.await {
                            Ok(None) => response(&group, &sub, ResponseCode::Success),
                            Ok(Some(value)) => data_response(&group, &sub, value),
                            Err(e) => {
                                warn!("{group} {sub} failed: {e:#}");
                                response(&group, &sub, ResponseCode::Error)
                            }
                        };
                        let _ = outbound.send(Outbound::Frame(encode_message(items)));
                    });
                }
                None
            }
        })
    }

    /// Sub-commands of group `""` that need session or helper state.
    fn handle_own_command(
        &mut self,
        key: SessionKey,
        client: &str,
        sub: &str,
        items: &[Value],
        now: Instant,
    ) -> Result<Own, ProtocolError> {
        let mut args = ArgParser::new(sub, client, items, COMMAND_ARG_OFFSET);
        let name = self.sessions.get(&key).map(Session::display_name).unwrap_or_default();
        let outcome = match sub {
            CMD_SET_PASSWORD => {
                let password = args.string()?;
                self.password = PasswordHash::for_password(&password);
                if password.is_empty() {
                    info!("Password CLEARED by {name}");
                } else {
                    info!("Password changed by {name}");
                }
                CommandOutcome::Success
            }
            CMD_GET_SCREENSHOT => {
                if !self.send_to_helper(vec![CMD_SCREENSHOT.into()]) {
                    warn!("Failed to send screenshot request to helper, helper may not be connected/running");
                    CommandOutcome::Failed
                } else {
                    self.waiters.push(Waiter {
                        target: WaiterTarget::Session {
                            key,
                            group: GROUP_NONE.to_string(),
                            sub: sub.to_string(),
                        },
                        deadline: now + self.deferred_timeout,
                    });
                    return Ok(Own::Deferred);
                }
            }
            CMD_SHOW_SCREEN_IDS_SUB => self.send_to_helper(vec![CMD_SHOW_SCREEN_IDS.into()]).into(),
            CMD_LOG_MESSAGE => {
                let level = args.int()?;
                let text = args.string()?;
                log_at(LogLevel::from_wire(level).unwrap_or(LogLevel::Normal), &format!("[{name}] {text}"));
                CommandOutcome::Success
            }
            _ => return Ok(Own::Delegate),
        };
        Ok(Own::Done(outcome))
    }

    fn send(&self, key: SessionKey, items: Vec<Value>) {
        if let Some(session) = self.sessions.get(&key) {
            session.send(items);
        }
    }

    // ── Fan-out ───────────────────────────────────────────────────────────────

    /// Pushes a value change to sessions subscribed to both `val` and its group.
    pub fn publish_value(&self, change: &ValueChange) {
        let mut frame = None;
        for session in self.sessions.values() {
            if session.authenticated && session.commands.contains(CMD_VALUE) && session.groups.contains(&change.group) {
                let bytes = frame.get_or_insert_with(|| {
                    encode_message(vec![
                        CMD_VALUE.into(),
                        change.group.as_str().into(),
                        change.item.as_str().into(),
                        change.property.as_str().into(),
                        change.value.clone(),
                    ])
                });
                let _ = session.outbound.send(Outbound::Frame(bytes.clone()));
            }
        }
    }

    pub fn publish_log(&self, level: LogLevel, message: &str) {
        let mut frame = None;
        for session in self.sessions.values() {
            if session.authenticated && session.commands.contains(CMD_LOG) {
                let bytes = frame.get_or_insert_with(|| {
                    encode_message(vec![CMD_LOG.into(), (level as i64).into(), message.into()])
                });
                let _ = session.outbound.send(Outbound::Frame(bytes.clone()));
            }
        }
    }

    // ── Deferred screenshots ──────────────────────────────────────────────────

    /// Asks the helper for a screenshot on the agent's own behalf. Returns
    /// false when no helper is connected.
    pub fn request_screenshot(&mut self, shot: InternalShot, now: Instant) -> bool {
        if !self.send_to_helper(vec![CMD_SCREENSHOT.into()]) {
            return false;
        }
        self.waiters.push(Waiter {
            target: WaiterTarget::Internal(shot),
            deadline: now + self.deferred_timeout,
        });
        true
    }

    fn complete_screenshot(&mut self, image: Vec<u8>) {
        for waiter in std::mem::take(&mut self.waiters) {
            match waiter.target {
                WaiterTarget::Session { key, group, sub } => {
                    self.send(key, data_response(&group, &sub, Value::Binary(image.clone())));
                }
                WaiterTarget::Internal(shot) => self.completions.push((shot, Some(image.clone()))),
            }
        }
    }

    fn fail_waiter(&mut self, waiter: Waiter) {
        match waiter.target {
            WaiterTarget::Session { key, group, sub } => self.send(key, response(&group, &sub, ResponseCode::Error)),
            WaiterTarget::Internal(shot) => self.completions.push((shot, None)),
        }
    }

    /// Fails every waiter whose deadline has passed.
    pub fn expire_waiters(&mut self, now: Instant) {
        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|w| w.deadline <= now);
        self.waiters = live;
        for waiter in expired {
            warn!("screenshot request timed out");
            self.fail_waiter(waiter);
        }
    }

    #[cfg(test)]
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Internal screenshots that finished (with the image) or failed (`None`).
    pub fn take_internal_completions(&mut self) -> Vec<(InternalShot, Option<Vec<u8>>)> {
        std::mem::take(&mut self.completions)
    }
}
