//! Side channels a running application uses to talk back to the agent:
//! a private log pipe (one text message per line) and an optional loopback
//! TCP listener (one tag byte per message). Both feed `AgentEvent`s and
//! both count as heartbeats.

use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::application::AppId;
use crate::event::AgentEvent;
use crate::logging::LogLevel;
use crate::paths;

const LOOPBACK_HEARTBEAT: u8 = b'h';
const LOOPBACK_ERROR: u8 = b'e';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackMessage {
    Heartbeat,
    Error(String),
    Unknown(u8),
}

impl LoopbackMessage {
    /// Parses one chunk as received from the socket. Empty chunks are ignored.
    pub fn parse(chunk: &[u8]) -> Option<Self> {
        let (&tag, rest) = chunk.split_first()?;
        Some(match tag {
            LOOPBACK_HEARTBEAT => LoopbackMessage::Heartbeat,
            LOOPBACK_ERROR => LoopbackMessage::Error(String::from_utf8_lossy(rest).trim_end().to_string()),
            other => LoopbackMessage::Unknown(other),
        })
    }
}

/// A parsed log pipe line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogMessage {
    Alert(String),
    Trigger(Vec<String>),
    Heartbeat,
    Log(LogLevel, String),
}

pub fn parse_log_line(line: &str) -> LogMessage {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(text) = line.strip_prefix("ALERT ") {
        return LogMessage::Alert(text.to_string());
    }
    if let Some(list) = line.strip_prefix("TRIGGER ") {
        return LogMessage::Trigger(split_list(list));
    }
    if line.trim() == "HEARTBEAT" {
        return LogMessage::Heartbeat;
    }
    for (prefix, level) in [
        ("ERROR ", LogLevel::Error),
        ("WARNING ", LogLevel::Warning),
        ("EXTRA ", LogLevel::Extra),
        ("DEBUG ", LogLevel::Debug),
    ] {
        if let Some(text) = line.strip_prefix(prefix) {
            return LogMessage::Log(level, text.to_string());
        }
    }
    LogMessage::Log(LogLevel::Normal, line.to_string())
}

/// Splits a `;`-delimited list, dropping empty entries.
pub fn split_list(list: &str) -> Vec<String> {
    list.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// The open side channels of one application run.
#[derive(Debug, Default)]
pub struct AppChannels {
    pipe_path: Option<PathBuf>,
    pipe_task: Option<JoinHandle<()>>,
    loopback_task: Option<JoinHandle<()>>,
}

impl AppChannels {
    /// Opens the log pipe, and the loopback listener when `loopback_port` is set.
    /// A channel that fails to open is logged and skipped; the app still starts.
    pub fn open(
        app: AppId,
        name: &str,
        loopback_port: Option<u16>,
        events: mpsc::Sender<AgentEvent>,
    ) -> Self {
        let mut channels = AppChannels::default();

        let pipe_path = paths::log_pipe_path(name);
        match open_log_pipe(app, &pipe_path, events.clone()) {
            Ok(task) => {
                channels.pipe_path = Some(pipe_path);
                channels.pipe_task = Some(task);
            }
            Err(e) => warn!("App {name}: log pipe unavailable: {e:#}"),
        }

        if let Some(port) = loopback_port {
            match bind_loopback(port) {
                Ok(listener) => {
                    channels.loopback_task = Some(tokio::spawn(serve_loopback(app, listener, events)));
                }
                Err(e) => warn!("App {name}: failed to listen on loopback port {port}: {e}"),
            }
        }

        channels
    }

    pub fn pipe_path(&self) -> Option<&std::path::Path> {
        self.pipe_path.as_deref()
    }

    pub fn close(&mut self) {
        if let Some(task) = self.pipe_task.take() {
            task.abort();
        }
        if let Some(task) = self.loopback_task.take() {
            task.abort();
        }
        if let Some(path) = self.pipe_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for AppChannels {
    fn drop(&mut self) {
        self.close();
    }
}

fn bind_loopback(port: u16) -> std::io::Result<TcpListener> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", port))?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

#[cfg(target_os = "linux")]
fn open_log_pipe(
    app: AppId,
    path: &std::path::Path,
    events: mpsc::Sender<AgentEvent>,
) -> anyhow::Result<JoinHandle<()>> {
    use anyhow::Context;
    use nix::sys::stat::Mode;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::unix::pipe;

    // A stale pipe from a previous run would be shared with a dead writer.
    let _ = std::fs::remove_file(path);
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .with_context(|| format!("mkfifo {}", path.display()))?;

    // Opened read-write so the reader never sees EOF between writers.
    let receiver = pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(path)
        .with_context(|| format!("open {}", path.display()))?;

    Ok(tokio::spawn(async move {
        let mut lines = BufReader::new(receiver).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if events.send(AgentEvent::AppLog { app, line }).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("log pipe read failed: {e}");
                    break;
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn open_log_pipe(
    _app: AppId,
    _path: &std::path::Path,
    _events: mpsc::Sender<AgentEvent>,
) -> anyhow::Result<JoinHandle<()>> {
    anyhow::bail!("log pipes are only supported on Linux")
}

async fn serve_loopback(app: AppId, listener: TcpListener, events: mpsc::Sender<AgentEvent>) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("loopback accept failed: {e}");
                continue;
            }
        };
        debug!("loopback connection from {peer}");
        let events = events.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Some(message) = LoopbackMessage::parse(&buf[..n]) {
                            if events.send(AgentEvent::Loopback { app, message }).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
    }
}
