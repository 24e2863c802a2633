//! Child process ownership.
//!
//! Each launched application gets one task that owns its `tokio::process::Child`.
//! The task reports `Started`/`Exited` back to the agent and accepts kill
//! requests over a channel, so the core never blocks on a process.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::application::AppId;
use crate::event::{AgentEvent, ProcessEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSpec {
    pub path: PathBuf,
    pub append: bool,
}

/// Everything needed to spawn one run of an application.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub directory: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub delay: Duration,
    pub capture: Option<CaptureSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillMode {
    /// SIGTERM, then a hard kill if the process outlives the timeout.
    Soft(Duration),
    Hard,
}

/// Handle to the task owning a launched child.
#[derive(Debug)]
pub struct ProcessHandle {
    kill_tx: mpsc::UnboundedSender<KillMode>,
    task: JoinHandle<()>,
}

impl ProcessHandle {
    pub fn kill(&self, mode: KillMode) -> bool {
        self.kill_tx.send(mode).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawns the owning task. Events are tagged with `app` and `generation`
/// so a report from an earlier run can be told apart from the current one.
pub fn launch(
    app: AppId,
    generation: u64,
    spec: LaunchSpec,
    events: mpsc::Sender<AgentEvent>,
) -> ProcessHandle {
    let (kill_tx, kill_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(app, generation, spec, kill_rx, events));
    ProcessHandle { kill_tx, task }
}

async fn run(
    app: AppId,
    generation: u64,
    spec: LaunchSpec,
    mut kill_rx: mpsc::UnboundedReceiver<KillMode>,
    events: mpsc::Sender<AgentEvent>,
) {
    let report = |event: ProcessEvent| {
        let events = events.clone();
        async move {
            let _ = events
                .send(AgentEvent::Process {
                    app,
                    generation,
                    event,
                })
                .await;
        }
    };

    if !spec.delay.is_zero() {
        debug!("App {}: delaying launch {} ms", spec.name, spec.delay.as_millis());
        tokio::select! {
            _ = sleep(spec.delay) => {}
            _ = kill_rx.recv() => {
                report(ProcessEvent::Cancelled).await;
                return;
            }
        }
    }

    let mut child = match spawn_child(&spec).await {
        Ok(child) => child,
        Err(e) => {
            report(ProcessEvent::FailedToStart(format!("{e:#}"))).await;
            return;
        }
    };

    let pid = child.id().unwrap_or_default();
    report(ProcessEvent::Started { pid }).await;

    if let Some(capture) = &spec.capture {
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(capture_stream(stdout, capture.path.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture_stream(stderr, capture.path.clone()));
        }
    }

    let mut kill_open = true;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            mode = kill_rx.recv(), if kill_open => match mode {
                Some(KillMode::Soft(grace)) if request_terminate(&child) => {
                    // The timer is dropped as soon as the child exits on its own.
                    match timeout(grace, child.wait()).await {
                        Ok(status) => break status,
                        Err(_) => {
                            warn!("App {}: did not exit within {} ms, killing", spec.name, grace.as_millis());
                            let _ = child.start_kill();
                        }
                    }
                }
                Some(_) => {
                    let _ = child.start_kill();
                }
                None => {
                    // Owner dropped the handle: nobody is supervising this child any more.
                    kill_open = false;
                    let _ = child.start_kill();
                }
            }
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("App {}: failed to wait for process: {e}", spec.name);
            None
        }
    };
    report(ProcessEvent::Exited { code }).await;
}

async fn spawn_child(spec: &LaunchSpec) -> Result<Child> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .kill_on_drop(true);
    if let Some(dir) = &spec.directory {
        cmd.current_dir(dir);
    }

    match &spec.capture {
        Some(capture) => {
            prepare_capture_file(capture).await?;
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        None => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    cmd.spawn()
        .with_context(|| format!("failed to spawn {}", spec.program.display()))
}

async fn prepare_capture_file(capture: &CaptureSpec) -> Result<()> {
    if let Some(parent) = capture.path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    if !capture.append {
        tokio::fs::File::create(&capture.path)
            .await
            .with_context(|| format!("failed to truncate {}", capture.path.display()))?;
    }
    Ok(())
}

async fn capture_stream<R: AsyncRead + Unpin>(mut reader: R, path: PathBuf) {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await;
    match file {
        Ok(mut file) => {
            if let Err(e) = tokio::io::copy(&mut reader, &mut file).await {
                debug!("console capture to {} ended: {e}", path.display());
            }
        }
        Err(e) => warn!("failed to open console capture {}: {e}", path.display()),
    }
}

/// Asks the child to exit gracefully. Returns false where no graceful
/// request exists, in which case the caller kills outright.
#[cfg(unix)]
fn request_terminate(child: &Child) -> bool {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok(),
        None => false,
    }
}

#[cfg(not(unix))]
fn request_terminate(_child: &Child) -> bool {
    false
}

// ── Executable resolution ─────────────────────────────────────────────────────

/// Resolves an executable by path, or by searching `PATH` when given a bare name.
pub fn resolve_executable(executable: &str, directory: Option<&Path>) -> Option<PathBuf> {
    let executable = executable.trim();
    if executable.is_empty() {
        return None;
    }
    let path = Path::new(executable);
    if path.is_absolute() {
        return is_executable_file(path).then(|| path.to_path_buf());
    }
    if executable.contains('/') || executable.contains('\\') {
        let candidate = match directory {
            Some(dir) => dir.join(path),
            None => path.to_path_buf(),
        };
        return is_executable_file(&candidate).then_some(candidate);
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(executable))
        .find(|candidate| is_executable_file(candidate))
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

/// Kills every process other than ourselves whose executable is `program`.
/// Returns how many were signalled.
pub fn terminate_matching(program: &Path) -> usize {
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet),
    );
    let own_pid = std::process::id();
    let target = std::fs::canonicalize(program).unwrap_or_else(|_| program.to_path_buf());

    let mut killed = 0;
    for p in sys.processes().values() {
        if p.pid().as_u32() == own_pid || p.exe() != Some(target.as_path()) {
            continue;
        }
        info!("terminating previous instance {} (pid {})", target.display(), p.pid());
        if p.kill() {
            killed += 1;
        }
    }
    killed
}

// ── One-shot commands ─────────────────────────────────────────────────────────

/// Runs a command to completion and returns its combined stdout and stderr.
/// The child is killed if it outlives `limit`.
pub async fn run_captured(
    program: &Path,
    args: &[String],
    directory: Option<&Path>,
    limit: Duration,
) -> Result<Vec<u8>> {
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
    if let Some(dir) = directory {
        cmd.current_dir(dir);
    }
    let output = match timeout(limit, cmd.output()).await {
        Ok(output) => output.with_context(|| format!("failed to run {}", program.display()))?,
        Err(_) => bail!("{} did not finish within {} s", program.display(), limit.as_secs()),
    };
    let mut data = output.stdout;
    data.extend_from_slice(&output.stderr);
    Ok(data)
}

/// Starts a command without waiting for it. A background task reaps it
/// and then removes `cleanup`, if given.
pub fn spawn_detached(
    program: &Path,
    args: &[String],
    directory: Option<&Path>,
    cleanup: Option<PathBuf>,
) -> Result<()> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = directory {
        cmd.current_dir(dir);
    }
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", program.display()))?;
    let program = program.display().to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!("{program} exited with {status}"),
            Err(e) => warn!("failed to wait for {program}: {e}"),
        }
        if let Some(path) = cleanup {
            let _ = tokio::fs::remove_file(path).await;
        }
    });
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh_spec(script: &str) -> LaunchSpec {
        LaunchSpec {
            name: "test".to_string(),
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            directory: None,
            env: Vec::new(),
            delay: Duration::ZERO,
            capture: None,
        }
    }

    async fn next_process_event(rx: &mut mpsc::Receiver<AgentEvent>) -> ProcessEvent {
        match timeout(Duration::from_secs(10), rx.recv()).await {
            Ok(Some(AgentEvent::Process { event, .. })) => event,
            other => panic!("expected process event, got {other:?}"),
        }
    }

    // ── resolve_executable ────────────────────────────────────────────────────

    #[test]
    fn resolve_absolute_path() {
        assert_eq!(resolve_executable("/bin/sh", None), Some(PathBuf::from("/bin/sh")));
    }

    #[test]
    fn resolve_bare_name_searches_path() {
        let resolved = resolve_executable("sh", None).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("sh"));
    }

    #[test]
    fn resolve_rejects_empty_and_missing() {
        assert_eq!(resolve_executable("", None), None);
        assert_eq!(resolve_executable("   ", None), None);
        assert_eq!(resolve_executable("/definitely/not/here", None), None);
        assert_eq!(resolve_executable("no-such-binary-pinhole", None), None);
    }

    #[test]
    fn resolve_relative_path_against_directory() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("run.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(resolve_executable("./run.sh", Some(dir.path())), Some(dir.path().join("./run.sh")));
    }

    #[test]
    fn resolve_rejects_non_executable_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.txt");
        std::fs::write(&file, "x").unwrap();
        assert_eq!(resolve_executable(file.to_str().unwrap(), None), None);
    }

    // ── launch ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn launch_reports_start_and_exit_code() {
        let (tx, mut rx) = mpsc::channel(8);
        let _handle = launch(AppId(1), 1, sh_spec("exit 3"), tx);
        assert!(matches!(next_process_event(&mut rx).await, ProcessEvent::Started { .. }));
        assert_eq!(next_process_event(&mut rx).await, ProcessEvent::Exited { code: Some(3) });
    }

    #[tokio::test]
    async fn launch_reports_spawn_failure() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut spec = sh_spec("");
        spec.program = PathBuf::from("/definitely/not/here");
        let _handle = launch(AppId(1), 1, spec, tx);
        assert!(matches!(next_process_event(&mut rx).await, ProcessEvent::FailedToStart(_)));
    }

    #[tokio::test]
    async fn soft_kill_lets_process_exit_on_sigterm() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = launch(AppId(1), 1, sh_spec("trap 'exit 7' TERM; while true; do sleep 0.05; done"), tx);
        assert!(matches!(next_process_event(&mut rx).await, ProcessEvent::Started { .. }));
        // Give the shell a moment to install its trap.
        sleep(Duration::from_millis(200)).await;
        handle.kill(KillMode::Soft(Duration::from_secs(5)));
        assert_eq!(next_process_event(&mut rx).await, ProcessEvent::Exited { code: Some(7) });
    }

    #[tokio::test]
    async fn soft_kill_escalates_after_timeout() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = launch(AppId(1), 1, sh_spec("trap '' TERM; while true; do sleep 0.05; done"), tx);
        assert!(matches!(next_process_event(&mut rx).await, ProcessEvent::Started { .. }));
        sleep(Duration::from_millis(200)).await;
        handle.kill(KillMode::Soft(Duration::from_millis(200)));
        // Killed by SIGKILL: no exit code.
        assert_eq!(next_process_event(&mut rx).await, ProcessEvent::Exited { code: None });
    }

    #[tokio::test]
    async fn kill_during_launch_delay_cancels_spawn() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut spec = sh_spec("exit 0");
        spec.delay = Duration::from_secs(30);
        let handle = launch(AppId(1), 1, spec, tx);
        handle.kill(KillMode::Hard);
        assert_eq!(next_process_event(&mut rx).await, ProcessEvent::Cancelled);
    }

    #[tokio::test]
    async fn console_capture_truncates_then_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appoutput").join("t.output");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "stale\n").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let mut spec = sh_spec("echo out; echo err 1>&2");
        spec.capture = Some(CaptureSpec {
            path: path.clone(),
            append: false,
        });
        let _handle = launch(AppId(1), 1, spec, tx);
        assert!(matches!(next_process_event(&mut rx).await, ProcessEvent::Started { .. }));
        assert!(matches!(next_process_event(&mut rx).await, ProcessEvent::Exited { .. }));
        sleep(Duration::from_millis(200)).await;

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("stale"));
        assert!(content.contains("out"));
        assert!(content.contains("err"));
    }

    // ── one-shot commands ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn run_captured_collects_stdout_and_stderr() {
        let args = vec!["-c".to_string(), "echo hello; echo oops 1>&2".to_string()];
        let data = run_captured(Path::new("/bin/sh"), &args, None, Duration::from_secs(10))
            .await
            .unwrap();
        let text = String::from_utf8(data).unwrap();
        assert!(text.contains("hello"));
        assert!(text.contains("oops"));
    }

    #[tokio::test]
    async fn run_captured_times_out() {
        let args = vec!["-c".to_string(), "sleep 5".to_string()];
        let result = run_captured(Path::new("/bin/sh"), &args, None, Duration::from_millis(100)).await;
        assert!(result.is_err());
    }
}
