use bytes::Bytes;
use tokio::sync::mpsc;

use crate::app_io::LoopbackMessage;
use crate::application::AppId;
use crate::config::Config;
use crate::dispatcher::{Outbound, SessionKey};

/// Everything that reaches the agent core. Background tasks own their I/O
/// and report here; only the core mutates business state.
#[derive(Debug)]
pub enum AgentEvent {
    /// A peer finished its TLS handshake (or a proxied virtual connection opened).
    SessionOpened {
        key: SessionKey,
        id: String,
        local: bool,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    /// One complete frame payload from a session, in arrival order.
    Frame { key: SessionKey, payload: Bytes },
    SessionClosed { key: SessionKey },
    /// Lifecycle report from the task that owns a child process.
    Process {
        app: AppId,
        generation: u64,
        event: ProcessEvent,
    },
    /// One line written by a child into its log pipe.
    AppLog { app: AppId, line: String },
    /// One message received on an application's loopback listener.
    Loopback { app: AppId, message: LoopbackMessage },
    /// The bootstrap config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// Ctrl+C / SIGTERM, or a terminate command from a client.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Started { pid: u32 },
    FailedToStart(String),
    /// Killed during the launch delay, before a process existed.
    Cancelled,
    Exited { code: Option<i32> },
}
