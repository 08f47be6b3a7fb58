/// Lifecycle hook scripts.
///
/// Every configured hook type gets one long-lived worker when the dispatcher
/// starts. `trigger` only enqueues; the worker runs invocations strictly in
/// submission order, one at a time, so a burst of `post_task` hooks never
/// overlaps. Workers of different hook types run independently of each other.
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{HookConfig, HookKind};

pub const STARTUP: &str = "startup";
pub const NIGHT_START: &str = "night_start";
pub const NIGHT_END: &str = "night_end";
pub const POST_TASK: &str = "post_task";

/// A single hook argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookValue {
    Flag(bool),
    Text(String),
}

impl From<bool> for HookValue {
    fn from(value: bool) -> Self {
        HookValue::Flag(value)
    }
}

impl From<&str> for HookValue {
    fn from(value: &str) -> Self {
        HookValue::Text(value.to_string())
    }
}

impl From<String> for HookValue {
    fn from(value: String) -> Self {
        HookValue::Text(value)
    }
}

impl From<&Path> for HookValue {
    fn from(value: &Path) -> Self {
        HookValue::Text(value.display().to_string())
    }
}

pub type HookArgs = BTreeMap<String, HookValue>;

/// Flattens `args` into command-line flags: `true` becomes a bare `--key`,
/// `false` is dropped, text becomes `--key value`.
pub fn to_flags(args: &HookArgs) -> Vec<String> {
    let mut flags = Vec::with_capacity(args.len() * 2);
    for (key, value) in args {
        match value {
            HookValue::Flag(true) => flags.push(format!("--{key}")),
            HookValue::Flag(false) => {}
            HookValue::Text(text) => {
                flags.push(format!("--{key}"));
                flags.push(text.clone());
            }
        }
    }
    flags
}

/// Something a hook worker can execute. Implementations may block.
pub trait Runnable: Send + Sync {
    fn run(&self, args: &HookArgs) -> Result<()>;
    fn describe(&self) -> String;
}

/// A script run as a subprocess with flattened arguments.
pub struct ExternalScript {
    path: PathBuf,
}

impl ExternalScript {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn command(&self) -> Command {
        let interpreter = match self.path.extension().and_then(|e| e.to_str()) {
            Some("py") => Some("python3"),
            Some("sh") => Some("sh"),
            _ => None,
        };
        match interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&self.path);
                cmd
            }
            None => Command::new(&self.path),
        }
    }
}

impl Runnable for ExternalScript {
    fn run(&self, args: &HookArgs) -> Result<()> {
        let flags = to_flags(args);
        info!(script = %self.path.display(), args = ?flags, "executing hook script");
        let output = self
            .command()
            .args(&flags)
            .output()
            .with_context(|| format!("Failed to launch {}", self.path.display()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            info!(script = %self.path.display(), output = %stdout.trim(), "hook script output");
        }
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.path.display(),
                output.status,
                stderr.trim()
            );
        }
        if !stderr.trim().is_empty() {
            warn!(script = %self.path.display(), stderr = %stderr.trim(), "hook script stderr");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

pub type EntryFn = Arc<dyn Fn(&HookArgs) -> Result<()> + Send + Sync>;

/// Named in-process hook entry points.
#[derive(Clone, Default)]
pub struct EntryPoints {
    entries: HashMap<String, EntryFn>,
}

impl EntryPoints {
    /// Registry containing the built-in `log` entry point.
    pub fn builtin() -> Self {
        let mut entries = Self::default();
        entries.register("log", |args| {
            info!(args = ?args, "hook invoked");
            Ok(())
        });
        entries
    }

    pub fn register<F>(&mut self, name: &str, entry: F)
    where
        F: Fn(&HookArgs) -> Result<()> + Send + Sync + 'static,
    {
        self.entries.insert(name.to_string(), Arc::new(entry));
    }

    fn get(&self, name: &str) -> Option<EntryFn> {
        self.entries.get(name).cloned()
    }
}

/// A hook implemented by a registered entry point.
pub struct InProcess {
    entry: String,
    entries: Arc<EntryPoints>,
}

impl InProcess {
    pub fn new(entry: impl Into<String>, entries: Arc<EntryPoints>) -> Self {
        Self {
            entry: entry.into(),
            entries,
        }
    }
}

impl Runnable for InProcess {
    fn run(&self, args: &HookArgs) -> Result<()> {
        let Some(entry) = self.entries.get(&self.entry) else {
            bail!("no entry point named '{}' is registered", self.entry);
        };
        entry(args)
    }

    fn describe(&self) -> String {
        format!("in-process:{}", self.entry)
    }
}

/// One hook type's worker as assembled before the dispatcher starts.
pub struct HookSpec {
    pub hook_type: String,
    /// Checked at trigger time; triggers fail while it is missing.
    pub script: Option<PathBuf>,
    pub runnable: Arc<dyn Runnable>,
}

impl HookSpec {
    /// Builds the spec for one configured hook, or `None` if the entry is unusable.
    pub fn from_config(hook_type: &str, config: &HookConfig, entries: &Arc<EntryPoints>) -> Option<Self> {
        match config.kind {
            HookKind::External => {
                let Some(path) = config.path.clone() else {
                    warn!(hook = hook_type, "external hook has no script path, ignoring");
                    return None;
                };
                Some(Self {
                    hook_type: hook_type.to_string(),
                    script: Some(path.clone()),
                    runnable: Arc::new(ExternalScript::new(path)),
                })
            }
            HookKind::InProcess => {
                let Some(entry) = config.entry.clone() else {
                    warn!(hook = hook_type, "in-process hook has no entry point, ignoring");
                    return None;
                };
                Some(Self {
                    hook_type: hook_type.to_string(),
                    script: None,
                    runnable: Arc::new(InProcess::new(entry, Arc::clone(entries))),
                })
            }
        }
    }
}

struct Worker {
    script: Option<PathBuf>,
    tx: Mutex<Option<mpsc::UnboundedSender<HookArgs>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

pub struct HookDispatcher {
    workers: HashMap<String, Worker>,
}

impl HookDispatcher {
    /// Starts one worker per usable entry in `hooks`.
    /// Must be called from within a tokio runtime.
    pub fn start(hooks: &BTreeMap<String, HookConfig>, entries: EntryPoints) -> Self {
        let entries = Arc::new(entries);
        let specs = hooks
            .iter()
            .filter_map(|(hook_type, config)| HookSpec::from_config(hook_type, config, &entries))
            .collect();
        Self::with_specs(specs)
    }

    pub fn with_specs(specs: Vec<HookSpec>) -> Self {
        let mut workers = HashMap::new();
        for spec in specs {
            let (tx, rx) = mpsc::unbounded_channel();
            info!(hook = %spec.hook_type, script = %spec.runnable.describe(), "hook worker started");
            let task = tokio::spawn(work(spec.hook_type.clone(), spec.runnable, rx));
            workers.insert(
                spec.hook_type,
                Worker {
                    script: spec.script,
                    tx: Mutex::new(Some(tx)),
                    task: Mutex::new(Some(task)),
                },
            );
        }
        Self { workers }
    }

    /// Queues `args` for the `hook_type` worker and returns without waiting.
    /// Returns `false` if the hook is not configured, its script is missing,
    /// or the dispatcher has been drained.
    pub fn trigger(&self, hook_type: &str, args: HookArgs) -> bool {
        let Some(worker) = self.workers.get(hook_type) else {
            warn!(hook = hook_type, "script not configured for hook");
            return false;
        };
        if let Some(script) = &worker.script {
            if !script.exists() {
                warn!(hook = hook_type, script = %script.display(), "hook script not found");
                return false;
            }
        }
        let queued = match lock(&worker.tx).as_ref() {
            Some(tx) => tx.send(args).is_ok(),
            None => false,
        };
        if queued {
            debug!(hook = hook_type, "hook queued");
        } else {
            warn!(hook = hook_type, "hook worker is not accepting work");
        }
        queued
    }

    pub fn is_configured(&self, hook_type: &str) -> bool {
        self.workers.contains_key(hook_type)
    }

    /// Lets every worker finish its queue, then waits for all of them to exit.
    pub async fn drain_all(&self) {
        for worker in self.workers.values() {
            lock(&worker.tx).take();
        }
        for (hook_type, worker) in &self.workers {
            let task = lock(&worker.task).take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    error!(hook = %hook_type, error = %e, "hook worker panicked");
                }
            }
        }
    }
}

async fn work(hook_type: String, runnable: Arc<dyn Runnable>, mut rx: mpsc::UnboundedReceiver<HookArgs>) {
    while let Some(args) = rx.recv().await {
        let started = Instant::now();
        let script = runnable.describe();
        let job = Arc::clone(&runnable);
        match tokio::task::spawn_blocking(move || job.run(&args)).await {
            Ok(Ok(())) => info!(
                hook = %hook_type,
                script = %script,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "hook finished"
            ),
            Ok(Err(e)) => error!(hook = %hook_type, script = %script, error = %format!("{e:#}"), "hook failed"),
            Err(e) => error!(hook = %hook_type, script = %script, error = %e, "hook panicked"),
        }
    }
    debug!(hook = %hook_type, "hook worker stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn args(pairs: &[(&str, HookValue)]) -> HookArgs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn in_process(hook_type: &str, entry: &str) -> (String, HookConfig) {
        (
            hook_type.to_string(),
            HookConfig {
                path: None,
                kind: HookKind::InProcess,
                entry: Some(entry.to_string()),
            },
        )
    }

    // ── flag flattening ───────────────────────────────────────────────────────

    #[test]
    fn flags_follow_bool_and_text_rules() {
        let flags = to_flags(&args(&[
            ("task_id", "1234".into()),
            ("dry_run", true.into()),
            ("verbose", false.into()),
            ("fits_file", Path::new("/data/1234_M31.fits").into()),
        ]));
        assert_eq!(
            flags,
            vec!["--dry_run", "--fits_file", "/data/1234_M31.fits", "--task_id", "1234"]
        );
    }

    #[test]
    fn interpreter_is_inferred_from_extension() {
        let py = ExternalScript::new("hooks/post_task.py").command();
        assert_eq!(py.get_program(), "python3");
        let sh = ExternalScript::new("hooks/post_task.sh").command();
        assert_eq!(sh.get_program(), "sh");
        let bin = ExternalScript::new("hooks/post_task").command();
        assert_eq!(bin.get_program(), "hooks/post_task");
    }

    // ── trigger preconditions ─────────────────────────────────────────────────

    #[tokio::test]
    async fn trigger_unconfigured_hook_fails() {
        let dispatcher = HookDispatcher::start(&BTreeMap::new(), EntryPoints::builtin());
        assert!(!dispatcher.trigger(POST_TASK, HookArgs::new()));
    }

    #[tokio::test]
    async fn trigger_with_missing_script_fails() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = BTreeMap::from([(
            NIGHT_START.to_string(),
            HookConfig {
                path: Some(dir.path().join("missing.sh")),
                kind: HookKind::External,
                entry: None,
            },
        )]);
        let dispatcher = HookDispatcher::start(&hooks, EntryPoints::default());
        assert!(dispatcher.is_configured(NIGHT_START));
        assert!(!dispatcher.trigger(NIGHT_START, HookArgs::new()));
        dispatcher.drain_all().await;
    }

    #[tokio::test]
    async fn external_hook_without_path_is_not_configured() {
        let hooks = BTreeMap::from([(STARTUP.to_string(), HookConfig::default())]);
        let dispatcher = HookDispatcher::start(&hooks, EntryPoints::default());
        assert!(!dispatcher.is_configured(STARTUP));
    }

    #[tokio::test]
    async fn trigger_after_drain_fails() {
        let hooks = BTreeMap::from([in_process(STARTUP, "log")]);
        let dispatcher = HookDispatcher::start(&hooks, EntryPoints::builtin());
        assert!(dispatcher.trigger(STARTUP, HookArgs::new()));
        dispatcher.drain_all().await;
        assert!(!dispatcher.trigger(STARTUP, HookArgs::new()));
    }

    // ── ordering ──────────────────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread")]
    async fn same_type_runs_sequentially_in_submission_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut entries = EntryPoints::default();
        {
            let (order, active, max_active) = (order.clone(), active.clone(), max_active.clone());
            entries.register("record", move |args| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                order.lock().unwrap().push(args["n"].clone());
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let hooks = BTreeMap::from([in_process(POST_TASK, "record")]);
        let dispatcher = HookDispatcher::start(&hooks, entries);

        for n in ["1", "2", "3"] {
            assert!(dispatcher.trigger(POST_TASK, args(&[("n", n.into())])));
        }
        dispatcher.drain_all().await;

        assert_eq!(
            *order.lock().unwrap(),
            vec![HookValue::from("1"), "2".into(), "3".into()]
        );
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn different_types_do_not_block_each_other() {
        let (signal_tx, signal_rx) = std::sync::mpsc::channel::<()>();
        let signal_rx = Arc::new(Mutex::new(signal_rx));
        let saw_other = Arc::new(Mutex::new(false));

        let mut entries = EntryPoints::default();
        {
            let (signal_rx, saw_other) = (signal_rx.clone(), saw_other.clone());
            entries.register("wait_for_other", move |_| {
                let received = signal_rx
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(5))
                    .is_ok();
                *saw_other.lock().unwrap() = received;
                Ok(())
            });
        }
        entries.register("signal", move |_| {
            let _ = signal_tx.send(());
            Ok(())
        });

        let hooks = BTreeMap::from([
            in_process(POST_TASK, "wait_for_other"),
            in_process(NIGHT_END, "signal"),
        ]);
        let dispatcher = HookDispatcher::start(&hooks, entries);
        assert!(dispatcher.trigger(POST_TASK, HookArgs::new()));
        assert!(dispatcher.trigger(NIGHT_END, HookArgs::new()));
        dispatcher.drain_all().await;

        assert!(*saw_other.lock().unwrap());
    }

    // ── failures ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn missing_entry_point_does_not_stop_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut entries = EntryPoints::default();
        {
            let calls = calls.clone();
            entries.register("count", move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let hooks = BTreeMap::from([in_process(STARTUP, "nope"), in_process(NIGHT_START, "count")]);
        let dispatcher = HookDispatcher::start(&hooks, entries);

        assert!(dispatcher.trigger(STARTUP, HookArgs::new()));
        assert!(dispatcher.trigger(NIGHT_START, HookArgs::new()));
        dispatcher.drain_all().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_entry_is_followed_by_next_item() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut entries = EntryPoints::default();
        {
            let calls = calls.clone();
            entries.register("flaky", move |_| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    bail!("first call fails");
                }
                Ok(())
            });
        }
        let hooks = BTreeMap::from([in_process(POST_TASK, "flaky")]);
        let dispatcher = HookDispatcher::start(&hooks, entries);

        assert!(dispatcher.trigger(POST_TASK, HookArgs::new()));
        assert!(dispatcher.trigger(POST_TASK, HookArgs::new()));
        dispatcher.drain_all().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_script_receives_flags_and_failures_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let script = dir.path().join("post_task.sh");
        std::fs::write(
            &script,
            format!(
                "echo \"$@\" >> {}\n[ \"$2\" = fail ] && {{ echo boom >&2; exit 1; }}\nexit 0\n",
                log.display()
            ),
        )
        .unwrap();

        let hooks = BTreeMap::from([(
            POST_TASK.to_string(),
            HookConfig {
                path: Some(script),
                kind: HookKind::External,
                entry: None,
            },
        )]);
        let dispatcher = HookDispatcher::start(&hooks, EntryPoints::default());

        assert!(dispatcher.trigger(POST_TASK, args(&[("task_id", "fail".into())])));
        assert!(dispatcher.trigger(
            POST_TASK,
            args(&[("task_id", "1234".into()), ("fits_file", "/data/1234.fits".into())])
        ));
        dispatcher.drain_all().await;

        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(
            calls.lines().collect::<Vec<_>>(),
            vec!["--task_id fail", "--fits_file /data/1234.fits --task_id 1234"]
        );
    }
}
