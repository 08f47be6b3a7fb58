/// Detection of frames written by the imaging software.
///
/// The imaging software writes each file incrementally, so a creation event
/// arrives long before the content is complete. Every new path is polled until
/// two consecutive size readings agree (and are non-zero) before the handler
/// sees it. Paths are deduplicated for the lifetime of the detector: the
/// handler runs at most once per path no matter how many events arrive.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;

/// Called once per confirmed file.
pub trait ArrivalHandler: Send + Sync {
    fn on_arrival(&self, path: &Path) -> Result<()>;
}

/// Bookkeeping for one detected path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub first_size: u64,
    pub last_size: u64,
    pub observed_at: DateTime<Local>,
    /// Set once the size settled (or the file predates the watcher).
    pub confirmed: bool,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Lower-cased suffix including the leading dot.
    pub extension: String,
    pub stability_timeout: Duration,
    pub poll_interval: Duration,
}

impl DetectorSettings {
    pub fn new(extension: &str, stability_timeout: Duration, poll_interval: Duration) -> Self {
        let extension = extension.trim().to_lowercase();
        let extension = if extension.starts_with('.') {
            extension
        } else {
            format!(".{extension}")
        };
        Self {
            extension,
            stability_timeout,
            poll_interval,
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| name.to_string_lossy().to_lowercase().ends_with(&self.extension))
            .unwrap_or(false)
    }
}

impl From<&MonitorConfig> for DetectorSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self::new(
            &config.file_extension,
            config.stability_timeout(),
            config.stability_poll(),
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Stability {
    Stable(u64),
    TimedOut(u64),
    Vanished,
}

struct Shared {
    settings: DetectorSettings,
    seen: Mutex<HashMap<PathBuf, WatchedFile>>,
}

struct Running {
    directory: PathBuf,
    handler: Arc<dyn ArrivalHandler>,
    // Dropping the watcher ends event delivery.
    watcher: Option<RecommendedWatcher>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct FileArrivalDetector {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl FileArrivalDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                seen: Mutex::new(HashMap::new()),
            }),
            running: Mutex::new(None),
        }
    }

    /// Starts watching `directory` (non-recursively), creating it if needed.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, directory: &Path, handler: Arc<dyn ArrivalHandler>) -> Result<()> {
        let mut running = lock(&self.running);
        if running.is_some() {
            anyhow::bail!("file monitor is already running");
        }

        std::fs::create_dir_all(directory)
            .with_context(|| format!("Failed to create monitor directory {}", directory.display()))?;
        let directory = directory
            .canonicalize()
            .with_context(|| format!("Failed to resolve monitor directory {}", directory.display()))?;

        let (event_tx, event_rx) = mpsc::channel::<notify::Event>(64);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let _ = event_tx.blocking_send(event);
                }
                Err(e) => error!(error = %e, "file watcher error"),
            },
            NotifyConfig::default(),
        )
        .context("Failed to create file watcher")?;
        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", directory.display()))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(dispatch(
            Arc::clone(&self.shared),
            Arc::clone(&handler),
            event_rx,
            stop_rx,
        ));

        info!(directory = %directory.display(), extension = %self.shared.settings.extension, "file monitor started");
        *running = Some(Running {
            directory,
            handler,
            watcher: Some(watcher),
            stop_tx,
            task,
        });
        Ok(())
    }

    /// Stops watching. A file already being processed finishes first.
    pub async fn stop(&self) {
        let running = lock(&self.running).take();
        let Some(mut running) = running else {
            return;
        };
        info!("stopping file monitor");
        drop(running.watcher.take());
        let _ = running.stop_tx.send(true);
        if let Err(e) = running.task.await {
            error!(error = %e, "file monitor task panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Reports every matching file already present in the watched directory.
    /// Returns the number of files handed to the handler.
    pub async fn process_existing(&self) -> usize {
        let (directory, handler) = match lock(&self.running).as_ref() {
            Some(running) => (running.directory.clone(), Arc::clone(&running.handler)),
            None => {
                warn!("process_existing called before the file monitor was started");
                return 0;
            }
        };

        let mut paths = match existing_files(&directory, &self.shared.settings).await {
            Ok(paths) => paths,
            Err(e) => {
                error!(error = %e, "failed to scan monitor directory");
                return 0;
            }
        };
        paths.sort();

        let mut count = 0;
        for path in paths {
            let size = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(_) => continue,
            };
            if !self.shared.mark_seen(&path, size, true) {
                continue;
            }
            info!(path = %path.display(), "processing existing file");
            invoke(&handler, path).await;
            count += 1;
        }
        count
    }

    /// Returns the bookkeeping entry for `path`, if it was ever seen.
    #[cfg(test)]
    pub fn watched(&self, path: &Path) -> Option<WatchedFile> {
        lock(&self.shared.seen).get(path).cloned()
    }
}

impl Shared {
    /// Records a first sighting. Returns `false` if `path` was already known.
    fn mark_seen(&self, path: &Path, size: u64, confirmed: bool) -> bool {
        let mut seen = lock(&self.seen);
        if seen.contains_key(path) {
            return false;
        }
        seen.insert(
            path.to_path_buf(),
            WatchedFile {
                path: path.to_path_buf(),
                first_size: size,
                last_size: size,
                observed_at: Local::now(),
                confirmed,
            },
        );
        true
    }

    fn record(&self, path: &Path, size: u64, confirmed: bool) -> Option<WatchedFile> {
        let mut seen = lock(&self.seen);
        let entry = seen.get_mut(path)?;
        entry.last_size = size;
        entry.observed_at = Local::now();
        entry.confirmed = confirmed;
        Some(entry.clone())
    }

    /// Waits for `path` to settle and hands it to `handler` exactly once.
    async fn process(&self, path: PathBuf, handler: &Arc<dyn ArrivalHandler>) {
        if !self.settings.matches(&path) {
            return;
        }
        let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        if !self.mark_seen(&path, size, false) {
            debug!(path = %path.display(), "already processed, skipping");
            return;
        }

        let entry = match wait_until_stable(&path, &self.settings).await {
            Stability::Stable(size) => self.record(&path, size, true),
            Stability::TimedOut(size) => {
                warn!(
                    path = %path.display(),
                    timeout_secs = self.settings.stability_timeout.as_secs(),
                    "timed out waiting for file to be complete, processing anyway"
                );
                self.record(&path, size, false)
            }
            Stability::Vanished => {
                debug!(path = %path.display(), "file disappeared before it settled");
                return;
            }
        };

        if let Some(entry) = entry {
            info!(
                path = %entry.path.display(),
                first_size = entry.first_size,
                size = entry.last_size,
                confirmed = entry.confirmed,
                observed_at = %entry.observed_at.to_rfc3339(),
                "new file detected"
            );
        }
        invoke(handler, path).await;
    }
}

async fn dispatch(
    shared: Arc<Shared>,
    handler: Arc<dyn ArrivalHandler>,
    mut event_rx: mpsc::Receiver<notify::Event>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                if !is_arrival(&event.kind) {
                    continue;
                }
                for path in event.paths {
                    shared.process(path, &handler).await;
                }
            }
            _ = stop_rx.changed() => break,
        }
    }
    debug!("file monitor task stopped");
}

fn is_arrival(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To))
    )
}

async fn wait_until_stable(path: &Path, settings: &DetectorSettings) -> Stability {
    let deadline = Instant::now() + settings.stability_timeout;
    let mut last: Option<u64> = None;
    loop {
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Stability::Vanished,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "failed to stat file");
                last.unwrap_or(0)
            }
        };
        if size > 0 && last == Some(size) {
            return Stability::Stable(size);
        }
        last = Some(size);
        if Instant::now() + settings.poll_interval > deadline {
            return Stability::TimedOut(size);
        }
        tokio::time::sleep(settings.poll_interval).await;
    }
}

async fn existing_files(directory: &Path, settings: &DetectorSettings) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(directory).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if settings.matches(&path) && entry.file_type().await?.is_file() {
            paths.push(path);
        }
    }
    Ok(paths)
}

/// Runs the handler off the async workers; failures are logged, never propagated.
async fn invoke(handler: &Arc<dyn ArrivalHandler>, path: PathBuf) {
    let handler = Arc::clone(handler);
    let shown = path.display().to_string();
    match tokio::task::spawn_blocking(move || handler.on_arrival(&path)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(path = %shown, error = %format!("{e:#}"), "error processing file"),
        Err(e) => error!(path = %shown, error = %e, "file handler panicked"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<PathBuf>>,
        fail_first: bool,
    }

    impl ArrivalHandler for Recorder {
        fn on_arrival(&self, path: &Path) -> Result<()> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(path.to_path_buf());
            if self.fail_first && calls.len() == 1 {
                anyhow::bail!("api unavailable");
            }
            Ok(())
        }
    }

    fn settings(timeout_ms: u64, poll_ms: u64) -> DetectorSettings {
        DetectorSettings::new(
            ".fits",
            Duration::from_millis(timeout_ms),
            Duration::from_millis(poll_ms),
        )
    }

    fn shared(settings: DetectorSettings) -> Shared {
        Shared {
            settings,
            seen: Mutex::new(HashMap::new()),
        }
    }

    // ── matching ──────────────────────────────────────────────────────────────

    #[test]
    fn extension_match_is_case_insensitive() {
        let s = DetectorSettings::new("fits", Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(s.extension, ".fits");
        assert!(s.matches(Path::new("/data/1234_M31.fits")));
        assert!(s.matches(Path::new("/data/1234_M31.FITS")));
        assert!(!s.matches(Path::new("/data/1234_M31.fits.tmp")));
        assert!(!s.matches(Path::new("/data/notes.txt")));
    }

    #[test]
    fn rename_into_directory_counts_as_arrival() {
        assert!(is_arrival(&EventKind::Modify(ModifyKind::Name(RenameMode::To))));
        assert!(!is_arrival(&EventKind::Modify(ModifyKind::Any)));
    }

    // ── stability wait ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn growing_file_fires_once_after_size_settles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.fits");
        std::fs::write(&path, b"").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            std::fs::write(&writer_path, vec![0u8; 512]).unwrap();
        });

        let shared = shared(settings(5_000, 200));
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn ArrivalHandler> = recorder.clone();
        shared.process(path.clone(), &handler).await;
        writer.await.unwrap();

        assert_eq!(*recorder.calls.lock().unwrap(), vec![path.clone()]);
        let entry = lock(&shared.seen).get(&path).cloned().unwrap();
        assert_eq!(entry.first_size, 0);
        assert_eq!(entry.last_size, 512);
        assert!(entry.confirmed);
    }

    #[tokio::test]
    async fn repeated_events_for_one_path_fire_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1234_M31.fits");
        std::fs::write(&path, vec![1u8; 64]).unwrap();

        let shared = shared(settings(2_000, 20));
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn ArrivalHandler> = recorder.clone();
        for _ in 0..3 {
            shared.process(path.clone(), &handler).await;
        }
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn vanished_file_is_abandoned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.fits");

        let shared = shared(settings(1_000, 20));
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn ArrivalHandler> = recorder.clone();
        shared.process(path.clone(), &handler).await;

        assert!(recorder.calls.lock().unwrap().is_empty());
        // Still remembered, so a late duplicate event is ignored too.
        assert!(lock(&shared.seen).contains_key(&path));
    }

    #[tokio::test]
    async fn empty_file_times_out_and_is_processed_anyway() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.fits");
        std::fs::write(&path, b"").unwrap();

        let shared = shared(settings(200, 50));
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn ArrivalHandler> = recorder.clone();
        let started = std::time::Instant::now();
        shared.process(path.clone(), &handler).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
        assert!(!lock(&shared.seen)[&path].confirmed);
    }

    #[tokio::test]
    async fn handler_error_does_not_block_later_files() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("1.fits");
        let second = dir.path().join("2.fits");
        std::fs::write(&first, vec![1u8; 8]).unwrap();
        std::fs::write(&second, vec![1u8; 8]).unwrap();

        let shared = shared(settings(1_000, 20));
        let recorder = Arc::new(Recorder {
            fail_first: true,
            ..Recorder::default()
        });
        let handler: Arc<dyn ArrivalHandler> = recorder.clone();
        shared.process(first.clone(), &handler).await;
        shared.process(second.clone(), &handler).await;

        assert_eq!(*recorder.calls.lock().unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn non_matching_files_are_not_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guide.log");
        std::fs::write(&path, b"hello").unwrap();

        let shared = shared(settings(1_000, 20));
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn ArrivalHandler> = recorder.clone();
        shared.process(path.clone(), &handler).await;

        assert!(recorder.calls.lock().unwrap().is_empty());
        assert!(lock(&shared.seen).is_empty());
    }

    // ── watcher ───────────────────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread")]
    async fn process_existing_reports_each_file_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.FITS"), b"data").unwrap();
        std::fs::write(dir.path().join("a.fits"), b"data").unwrap();
        std::fs::write(dir.path().join("c.txt"), b"data").unwrap();

        let detector = FileArrivalDetector::new(settings(1_000, 20));
        let recorder = Arc::new(Recorder::default());
        detector.start(dir.path(), recorder.clone()).unwrap();

        assert_eq!(detector.process_existing().await, 2);
        assert_eq!(detector.process_existing().await, 0);

        let names: Vec<String> = recorder
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.fits", "b.FITS"]);
        detector.stop().await;
        assert!(!detector.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn process_existing_before_start_does_nothing() {
        let detector = FileArrivalDetector::new(settings(1_000, 20));
        assert_eq!(detector.process_existing().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watcher_reports_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let detector = FileArrivalDetector::new(settings(5_000, 50));
        let recorder = Arc::new(Recorder::default());
        detector.start(dir.path(), recorder.clone()).unwrap();
        assert!(detector.start(dir.path(), recorder.clone()).is_err());

        let path = dir.path().canonicalize().unwrap().join("1234_M31_L.fits");
        std::fs::write(&path, vec![7u8; 256]).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while recorder.calls.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(*recorder.calls.lock().unwrap(), vec![path.clone()]);
        assert!(detector.watched(&path).unwrap().confirmed);
        detector.stop().await;
    }
}
