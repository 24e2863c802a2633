//! Outbound notifications from the managers to the agent core.
//!
//! Managers never call each other. Anything that crosses a manager boundary
//! (a value change to fan out, an alert to record, a schedule action to run
//! against the applications) is queued here and drained by the agent after
//! each event, in emission order.

use rmpv::Value;
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::application::AppId;

/// One `(group, item, property, value)` change, as fanned out to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    pub group: String,
    pub item: String,
    pub property: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Value(ValueChange),
    Alert(String),
    TriggerEvents(Vec<String>),
    StartApps(Vec<String>),
    StopApps(Vec<String>),
    RestartApps(Vec<String>),
    StartGroup(String),
    StopGroup(String),
    /// Capture the screen through the companion and write it to this path.
    Screenshot(PathBuf),
    /// A heartbeat lockup wants a screenshot before the app is stopped.
    LockupScreenshot {
        app: AppId,
        restart: bool,
        path: PathBuf,
    },
    AppRenamed {
        from: String,
        to: String,
    },
    AppDeleted(String),
    Shutdown,
    Reboot,
}

#[derive(Debug, Clone)]
pub struct Bus {
    tx: mpsc::UnboundedSender<Signal>,
}

impl Bus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, signal: Signal) {
        // The receiver lives as long as the agent; a closed bus only happens at teardown.
        let _ = self.tx.send(signal);
    }

    pub fn value(&self, group: &str, item: &str, property: &str, value: impl Into<Value>) {
        self.send(Signal::Value(ValueChange {
            group: group.to_string(),
            item: item.to_string(),
            property: property.to_string(),
            value: value.into(),
        }));
    }

    pub fn alert(&self, text: impl Into<String>) {
        self.send(Signal::Alert(text.into()));
    }
}

/// Test helper: collects everything queued so far.
#[cfg(test)]
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Signal>) -> Vec<Signal> {
    let mut out = Vec::new();
    while let Ok(s) = rx.try_recv() {
        out.push(s);
    }
    out
}
