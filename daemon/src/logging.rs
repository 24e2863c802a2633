use anyhow::{Context as _, Result};
use chrono::NaiveDate;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

use crate::paths::LOG_FILE_NAME;

/// Agent log levels as numbered on the wire. Higher is more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 1,
    Extra = 2,
    Normal = 3,
    Warning = 4,
    Error = 5,
}

impl LogLevel {
    pub fn from_wire(level: i64) -> Option<Self> {
        match level {
            1 => Some(Self::Debug),
            2 => Some(Self::Extra),
            3 => Some(Self::Normal),
            4 => Some(Self::Warning),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "debug" => Some(Self::Debug),
            "extra" => Some(Self::Extra),
            "normal" => Some(Self::Normal),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Extra => "extra",
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    pub fn from_tracing(level: &Level) -> Self {
        match *level {
            Level::ERROR => Self::Error,
            Level::WARN => Self::Warning,
            Level::INFO => Self::Normal,
            Level::DEBUG => Self::Extra,
            _ => Self::Debug,
        }
    }

    /// The `EnvFilter` directive that lets this level and everything above through.
    pub fn directive(self) -> &'static str {
        match self {
            Self::Debug => "trace",
            Self::Extra => "debug",
            Self::Normal => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }
}

/// Logs `text` at a level chosen at runtime.
pub fn log_at(level: LogLevel, text: &str) {
    match level {
        LogLevel::Error => tracing::error!("{text}"),
        LogLevel::Warning => tracing::warn!("{text}"),
        LogLevel::Normal => tracing::info!("{text}"),
        LogLevel::Extra => tracing::debug!("{text}"),
        LogLevel::Debug => tracing::trace!("{text}"),
    }
}

// ── Remote forwarding ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLogEntry {
    pub level: LogLevel,
    pub message: String,
}

/// Forwards the agent's own log events to the core so it can push them
/// to sessions subscribed to `log`. Events from dependencies are skipped.
pub struct RemoteLogLayer {
    tx: mpsc::UnboundedSender<RemoteLogEntry>,
    target_prefix: &'static str,
}

impl RemoteLogLayer {
    pub fn new(tx: mpsc::UnboundedSender<RemoteLogEntry>) -> Self {
        Self {
            tx,
            target_prefix: env!("CARGO_CRATE_NAME"),
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.message, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.message, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for RemoteLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if !meta.target().starts_with(self.target_prefix) {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let _ = self.tx.send(RemoteLogEntry {
            level: LogLevel::from_tracing(meta.level()),
            message: visitor.message,
        });
    }
}

// ── Subscriber setup ──────────────────────────────────────────────────────────

/// Keeps the file writer alive and allows the host filter to be swapped.
pub struct LoggingHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    log_dir: PathBuf,
    _guard: WorkerGuard,
}

impl LoggingHandle {
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn set_filter(&self, directive: &str) {
        match EnvFilter::try_new(directive) {
            Ok(filter) => {
                if let Err(e) = self.filter.reload(filter) {
                    tracing::warn!("failed to reload log filter: {e}");
                }
            }
            Err(e) => tracing::warn!("invalid log filter '{directive}': {e}"),
        }
    }

    pub fn set_level(&self, level: LogLevel) {
        self.set_filter(level.directive());
    }
}

/// Installs the global subscriber: stderr, a daily-rolling file in
/// `log_dir`, and the remote forwarding layer.
pub fn init(
    filter: &str,
    log_dir: &Path,
) -> Result<(LoggingHandle, mpsc::UnboundedReceiver<RemoteLogEntry>)> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, filter_handle) = reload::Layer::new(env_filter);

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let (remote_tx, remote_rx) = mpsc::unbounded_channel();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(RemoteLogLayer::new(remote_tx))
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok((
        LoggingHandle {
            filter: filter_handle,
            log_dir: log_dir.to_path_buf(),
            _guard: guard,
        },
        remote_rx,
    ))
}

// ── Log retrieval ─────────────────────────────────────────────────────────────

/// Concatenates the daily log files dated `start..=end` (`yyyy-MM-dd`).
/// Returns `None` if the dates do not parse or no file exists in the range.
pub fn read_log_range(log_dir: &Path, start: &str, end: &str) -> Option<Vec<u8>> {
    let start = NaiveDate::parse_from_str(start, "%Y-%m-%d").ok()?;
    let end = NaiveDate::parse_from_str(end, "%Y-%m-%d").ok()?;

    let mut out = Vec::new();
    let mut found = false;
    for day in start.iter_days().take_while(|d| *d <= end) {
        let path = log_dir.join(format!("{LOG_FILE_NAME}.{}", day.format("%Y-%m-%d")));
        if let Ok(data) = std::fs::read(&path) {
            out.extend_from_slice(&data);
            found = true;
        }
    }
    found.then_some(out)
}
