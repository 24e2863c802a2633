use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::error;

/// The event loop must feed the watchdog at least this often.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A dedicated OS thread that fires when the agent's event loop stops
/// feeding it. It runs outside tokio so a wedged runtime cannot starve it.
pub struct Watchdog {
    stamp: Arc<Mutex<Instant>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Starts the thread. `on_stall` runs once, the first time the last feed
    /// is older than `timeout`; the thread then exits.
    pub fn start<F>(timeout: Duration, poll: Duration, on_stall: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let stamp = Arc::new(Mutex::new(Instant::now()));
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stamp = Arc::clone(&stamp);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new().name("watchdog".into()).spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(poll);
                    let last = *stamp.lock().unwrap_or_else(|e| e.into_inner());
                    if last.elapsed() > timeout {
                        error!("event loop unresponsive for {:?}", last.elapsed());
                        on_stall();
                        return;
                    }
                }
            })?
        };
        Ok(Self {
            stamp,
            stop,
            thread: Some(thread),
        })
    }

    /// The production watchdog: exits the process so the service manager
    /// restarts the agent.
    pub fn start_default() -> std::io::Result<Self> {
        Self::start(STALL_TIMEOUT, POLL_INTERVAL, || std::process::exit(1))
    }

    pub fn feed(&self) {
        *self.stamp.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Stops the thread and waits for it.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
