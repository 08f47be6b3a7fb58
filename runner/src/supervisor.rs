/// Lifecycle management for the external imaging-control executable.
///
/// The [`ProcessSupervisor`] runs at most one instance of the executable at a
/// time. Output is drained by a background monitor task that forwards stdout
/// lines to a [`StatusSink`] and logs stderr. Stopping tears down the whole
/// process tree: every descendant and then the root get a graceful terminate
/// signal, and whatever is still alive after the timeout is killed.
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::process_tree::{ProcessTree, TreeSignal};

/// How long `stop` waits for the tree to die after the kill signal.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// How long `stop` waits for the monitor task to finish its cleanup.
const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Receives progress lines printed by the supervised process.
pub trait StatusSink: Send + Sync {
    fn on_status(&self, line: &str) -> anyhow::Result<()>;
}

/// Lifecycle state of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    NotStarted,
    Running,
    /// `stop` is tearing the process tree down.
    Terminating,
    /// The process is gone. `None` when it was ended by a signal.
    Exited(Option<i32>),
    /// The root process survived the forced kill.
    KillFailed,
}

impl ProcessStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, ProcessStatus::Running | ProcessStatus::Terminating)
    }
}

/// Reasons [`ProcessSupervisor::try_start`] refuses to launch.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("imaging process is already running")]
    AlreadyRunning,
    #[error("executable not found: {}", .0.display())]
    MissingExecutable(PathBuf),
    #[error("work-plan file not found: {}", .0.display())]
    MissingArtifact(PathBuf),
    #[error("failed to launch {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

struct ProcessHandle {
    pid: Option<u32>,
    /// A `try_start` call is between its checks and the spawn.
    starting: bool,
    /// Descendants seen during the last teardown.
    tree: Vec<u32>,
    status: ProcessStatus,
    sink: Option<Arc<dyn StatusSink>>,
}

impl ProcessHandle {
    fn clear(&mut self) {
        self.pid = None;
        self.tree.clear();
        self.sink = None;
    }
}

struct Monitor {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct ProcessSupervisor {
    executable: PathBuf,
    terminate_timeout: Duration,
    tree: Arc<dyn ProcessTree>,
    handle: Arc<Mutex<ProcessHandle>>,
    status_tx: Arc<watch::Sender<ProcessStatus>>,
    monitor: Mutex<Option<Monitor>>,
}

impl ProcessSupervisor {
    pub fn new(
        executable: impl Into<PathBuf>,
        terminate_timeout: Duration,
        tree: Arc<dyn ProcessTree>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ProcessStatus::NotStarted);
        Self {
            executable: executable.into(),
            terminate_timeout,
            tree,
            handle: Arc::new(Mutex::new(ProcessHandle {
                pid: None,
                starting: false,
                tree: Vec::new(),
                status: ProcessStatus::NotStarted,
                sink: None,
            })),
            status_tx: Arc::new(status_tx),
            monitor: Mutex::new(None),
        }
    }

    /// Launches `<executable> -s <artifact>` and returns immediately.
    /// Returns `false` (and logs why) if nothing was launched.
    pub fn start(&self, artifact: &Path, sink: Arc<dyn StatusSink>) -> bool {
        match self.try_start(artifact, sink) {
            Ok(pid) => {
                info!(pid, artifact = %artifact.display(), "imaging process started");
                true
            }
            Err(e) => {
                error!(error = %e, "failed to start imaging process");
                false
            }
        }
    }

    /// Like [`start`](Self::start) but reports the reason for a refusal.
    /// Must be called from within a tokio runtime.
    pub fn try_start(&self, artifact: &Path, sink: Arc<dyn StatusSink>) -> Result<u32, StartError> {
        {
            let mut handle = lock(&self.handle);
            if handle.status.is_live() || handle.starting {
                return Err(StartError::AlreadyRunning);
            }
            handle.starting = true;
        }
        let _reservation = StartReservation(self.handle.as_ref());

        if !self.executable.exists() {
            return Err(StartError::MissingExecutable(self.executable.clone()));
        }
        if !artifact.exists() {
            return Err(StartError::MissingArtifact(artifact.to_path_buf()));
        }

        info!(
            executable = %self.executable.display(),
            artifact = %artifact.display(),
            "launching imaging process"
        );
        let mut child = Command::new(&self.executable)
            .arg("-s")
            .arg(artifact)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StartError::Spawn {
                path: self.executable.clone(),
                source,
            })?;
        let pid = child.id().unwrap_or_default();
        let stdout = child.stdout.take().map(RawLines::new);
        let stderr = child.stderr.take().map(RawLines::new);

        {
            let mut handle = lock(&self.handle);
            handle.pid = Some(pid);
            handle.tree.clear();
            handle.status = ProcessStatus::Running;
            handle.sink = Some(Arc::clone(&sink));
            self.status_tx.send_replace(ProcessStatus::Running);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let release = HandleRelease {
            handle: Arc::clone(&self.handle),
            status_tx: Arc::clone(&self.status_tx),
            exit: None,
        };
        let task = tokio::spawn(monitor(child, stdout, stderr, sink, stop_rx, release));
        *lock(&self.monitor) = Some(Monitor { stop_tx, task });
        Ok(pid)
    }

    /// Tears down the process tree and waits until the process is gone.
    /// Afterwards `is_running()` is `false` and the handle is cleared.
    pub async fn stop(&self) {
        let pid = {
            let mut handle = lock(&self.handle);
            match (handle.status.is_live(), handle.pid) {
                (true, Some(pid)) => {
                    handle.status = ProcessStatus::Terminating;
                    Some(pid)
                }
                _ => None,
            }
        };

        if let Some(pid) = pid {
            self.status_tx.send_replace(ProcessStatus::Terminating);
            self.terminate_tree(pid).await;
        }

        let monitor = lock(&self.monitor).take();
        if let Some(monitor) = monitor {
            let _ = monitor.stop_tx.send(true);
            if tokio::time::timeout(MONITOR_JOIN_TIMEOUT, monitor.task).await.is_err() {
                warn!("output monitor did not finish in time; detaching it");
            }
        }

        let mut handle = lock(&self.handle);
        if handle.status.is_live() {
            handle.status = ProcessStatus::Exited(None);
        }
        handle.clear();
        self.status_tx.send_replace(handle.status);
    }

    pub fn is_running(&self) -> bool {
        lock(&self.handle).status.is_live()
    }

    pub fn status(&self) -> ProcessStatus {
        lock(&self.handle).status
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.handle).pid
    }

    /// Watches status changes, e.g. to notice a natural exit.
    pub fn subscribe(&self) -> watch::Receiver<ProcessStatus> {
        self.status_tx.subscribe()
    }

    async fn terminate_tree(&self, pid: u32) {
        let descendants = self.descendants(pid).await;
        lock(&self.handle).tree = descendants.clone();

        let mut targets = descendants.clone();
        targets.push(pid);
        info!(pid, descendants = descendants.len(), "terminating imaging process tree");
        self.signal_all(targets, TreeSignal::Terminate).await;

        if self.wait_for_exit(self.terminate_timeout).await {
            info!(pid, "imaging process exited gracefully");
            return;
        }

        warn!(
            pid,
            timeout_secs = self.terminate_timeout.as_secs(),
            "imaging process did not exit gracefully, killing process tree"
        );
        // Orphaned helpers may have been reparented, so keep the original list.
        let mut targets: BTreeSet<u32> = descendants.into_iter().collect();
        targets.extend(self.descendants(pid).await);
        let mut targets: Vec<u32> = targets.into_iter().collect();
        targets.push(pid);
        self.signal_all(targets, TreeSignal::Kill).await;

        if !self.wait_for_exit(KILL_GRACE).await {
            let tree = Arc::clone(&self.tree);
            let alive = tokio::task::spawn_blocking(move || tree.is_alive(pid))
                .await
                .unwrap_or(true);
            if alive {
                error!(pid, "imaging process survived forced kill");
                lock(&self.handle).status = ProcessStatus::KillFailed;
            }
        }
    }

    async fn descendants(&self, pid: u32) -> Vec<u32> {
        let tree = Arc::clone(&self.tree);
        tokio::task::spawn_blocking(move || tree.descendants(pid))
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "process tree enumeration panicked");
                Vec::new()
            })
    }

    async fn signal_all(&self, pids: Vec<u32>, signal: TreeSignal) {
        let tree = Arc::clone(&self.tree);
        let result = tokio::task::spawn_blocking(move || {
            for pid in pids {
                if !tree.signal(pid, signal) {
                    debug!(pid, ?signal, "signal not delivered");
                }
            }
        })
        .await;
        if let Err(e) = result {
            error!(error = %e, "signalling process tree panicked");
        }
    }

    /// Returns `true` once the monitor has observed the root exiting.
    async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.status_tx.subscribe();
        let exited = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| !s.is_live())).await,
            Ok(Ok(_))
        );
        exited
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases the start slot taken by `try_start`, whether or not the spawn worked.
struct StartReservation<'a>(&'a Mutex<ProcessHandle>);

impl Drop for StartReservation<'_> {
    fn drop(&mut self) {
        lock(self.0).starting = false;
    }
}

/// Clears the process handle when the monitor task ends, however it ends.
struct HandleRelease {
    handle: Arc<Mutex<ProcessHandle>>,
    status_tx: Arc<watch::Sender<ProcessStatus>>,
    exit: Option<Option<i32>>,
}

impl Drop for HandleRelease {
    fn drop(&mut self) {
        let mut handle = lock(&self.handle);
        if handle.status.is_live() {
            handle.status = ProcessStatus::Exited(self.exit.flatten());
        }
        handle.clear();
        self.status_tx.send_replace(handle.status);
    }
}

/// Line reader that tolerates output which is not valid UTF-8.
///
/// Partial lines stay in `buf` when a read is cancelled by `select!`, so the
/// next call picks up where the last one stopped.
struct RawLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> RawLines<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Returns the next line, or `None` at end of stream.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf)
            .trim_end_matches(&['\n', '\r'][..])
            .to_string();
        self.buf.clear();
        Ok(Some(line))
    }
}

type LineReader<R> = Option<RawLines<R>>;

async fn next_line<R: AsyncRead + Unpin>(lines: &mut LineReader<R>) -> std::io::Result<Option<String>> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

async fn monitor(
    mut child: Child,
    mut stdout: LineReader<tokio::process::ChildStdout>,
    mut stderr: LineReader<tokio::process::ChildStderr>,
    sink: Arc<dyn StatusSink>,
    mut stop_rx: watch::Receiver<bool>,
    mut release: HandleRelease,
) {
    let exit = loop {
        tokio::select! {
            biased;
            line = next_line(&mut stdout) => match line {
                Ok(Some(line)) => forward(&*sink, &line),
                Ok(None) => stdout = None,
                Err(e) => {
                    warn!(error = %e, "failed to read imaging process output");
                    stdout = None;
                }
            },
            line = next_line(&mut stderr) => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        error!(stderr = line, "imaging process error output");
                    }
                }
                Ok(None) => stderr = None,
                Err(e) => {
                    warn!(error = %e, "failed to read imaging process error output");
                    stderr = None;
                }
            },
            status = child.wait() => break status.ok().map(|s| s.code()),
            _ = stop_rx.changed() => {
                debug!("output monitor stop requested");
                break child.try_wait().ok().flatten().map(|s| s.code());
            }
        }
    };

    match exit {
        Some(code) => {
            // Lines written just before exit may still sit in the pipes.
            let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                while let Some(lines) = stdout.as_mut() {
                    match lines.next_line().await {
                        Ok(Some(line)) => forward(&*sink, &line),
                        _ => stdout = None,
                    }
                }
            })
            .await;
            if drained.is_err() {
                debug!("gave up draining output after exit");
            }
            info!(?code, "imaging process ended");
        }
        None => debug!("output monitor stopped before the process exit was observed"),
    }
    release.exit = exit;
    // Dropping the reader halves closes the pipes before the handle is cleared.
    drop(stdout);
    drop(stderr);
    drop(release);
}

fn forward(sink: &dyn StatusSink, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    debug!(output = line, "imaging process output");
    if let Err(e) = sink.on_status(line) {
        warn!(error = %e, "status callback failed");
    }
}
