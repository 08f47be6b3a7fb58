/// The night-cycle state machine.
///
/// The controller polls a night predicate on a fixed interval. When night
/// begins it fetches the night plan, compiles the pending tasks into a
/// sequence file and starts the imaging software against it. When the night
/// ends (or the imaging software exits on its own) it closes the night and
/// tears the process down. Frames reported by the file monitor are forwarded
/// to the task API and to the `post_task` hook independently of the cycle.
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Timelike};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::detector::{ArrivalHandler, FileArrivalDetector};
use crate::hooks::{self, HookArgs, HookDispatcher, HookValue};
use crate::plan::{self, PlanCompiler, PlanSource, STATUS_COMPLETED};
use crate::status::StatusBoard;
use crate::supervisor::{ProcessStatus, ProcessSupervisor, StatusSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    /// Night has begun but the imaging software is not running yet.
    AwaitingProcess,
    ActiveImaging,
    Draining,
}

/// Decides whether imaging is permitted at `now`.
pub trait NightPredicate: Send + Sync {
    fn is_night(&self, now: DateTime<Local>) -> bool;
}

/// Night spans the local hours `start..end`, wrapping past midnight when
/// `start >= end`. Equal hours mean the whole day counts as night.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourWindow {
    pub start: u32,
    pub end: u32,
}

impl HourWindow {
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start: start % 24,
            end: end % 24,
        }
    }

    pub fn contains_hour(&self, hour: u32) -> bool {
        if self.start < self.end {
            hour >= self.start && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

impl NightPredicate for HourWindow {
    fn is_night(&self, now: DateTime<Local>) -> bool {
        self.contains_hour(now.hour())
    }
}

/// Requests an orderly shutdown of a running controller.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Safe to call any number of times, from any task.
    pub fn shutdown(&self) {
        if !self.tx.send_replace(true) {
            info!("shutdown requested");
        }
    }
}

/// Cycle settings taken from the configuration file.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub poll_interval: Duration,
    pub observatory_id: String,
    pub monitor_dir: PathBuf,
    pub process_existing: bool,
}

impl From<&Config> for CycleSettings {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.cycle.poll_interval(),
            observatory_id: config.cycle.observatory_id.clone(),
            monitor_dir: config.paths.fits_monitor_dir.clone(),
            process_existing: config.monitor.process_existing,
        }
    }
}

pub struct NightCycleController {
    settings: CycleSettings,
    predicate: Box<dyn NightPredicate>,
    source: Arc<dyn PlanSource>,
    compiler: Arc<dyn PlanCompiler>,
    supervisor: Arc<ProcessSupervisor>,
    detector: FileArrivalDetector,
    hooks: Arc<HookDispatcher>,
    status: Arc<StatusBoard>,
    /// Task ids of the sequence currently being imaged.
    active_tasks: Arc<Mutex<HashSet<String>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    state: CycleState,
    was_night: bool,
    /// `night_start` fired and the matching `night_end` has not yet.
    night_open: bool,
}

impl NightCycleController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: CycleSettings,
        predicate: Box<dyn NightPredicate>,
        source: Arc<dyn PlanSource>,
        compiler: Arc<dyn PlanCompiler>,
        supervisor: Arc<ProcessSupervisor>,
        detector: FileArrivalDetector,
        hooks: Arc<HookDispatcher>,
        status: Arc<StatusBoard>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            settings,
            predicate,
            source,
            compiler,
            supervisor,
            detector,
            hooks,
            status,
            active_tasks: Arc::new(Mutex::new(HashSet::new())),
            shutdown_tx: Arc::new(shutdown_tx),
            state: CycleState::Idle,
            was_night: false,
            night_open: false,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Runs the cycle until a shutdown is requested, then cleans up.
    pub async fn run(mut self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut process_rx = self.supervisor.subscribe();

        for hook in [hooks::STARTUP, hooks::NIGHT_START, hooks::NIGHT_END, hooks::POST_TASK] {
            if !self.hooks.is_configured(hook) {
                debug!(hook, "no script configured for hook");
            }
        }
        self.hooks.trigger(hooks::STARTUP, HookArgs::new());

        let forwarder = Arc::new(ArrivalForwarder {
            source: Arc::clone(&self.source),
            hooks: Arc::clone(&self.hooks),
            status: Arc::clone(&self.status),
            active_tasks: Arc::clone(&self.active_tasks),
        });
        if let Err(e) = self.detector.start(&self.settings.monitor_dir, forwarder) {
            error!(error = format!("{e:#}"), "file monitor failed to start; arrivals will not be reported");
            self.status.update(|s| s.error = Some(format!("{e:#}")));
        }

        info!(
            poll_secs = self.settings.poll_interval.as_secs(),
            observatory = %self.settings.observatory_id,
            "runner ready"
        );
        if self.detector.is_running() && self.settings.process_existing {
            let count = self.detector.process_existing().await;
            info!(files = count, "processed existing files");
        }

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {}
                Ok(()) = process_rx.changed() => {
                    let status = *process_rx.borrow_and_update();
                    self.on_process_status(status).await;
                }
                _ = ticker.tick() => self.tick(Local::now()).await,
            }
        }

        self.shutdown_cleanup().await;
    }

    async fn tick(&mut self, now: DateTime<Local>) {
        let night = self.predicate.is_night(now);
        debug!(night, state = ?self.state, "cycle tick");
        match (self.was_night, night) {
            (false, true) => {
                info!("night started");
                let date = now.date_naive();
                self.hooks.trigger(hooks::NIGHT_START, date_args(date));
                self.night_open = true;
                self.set_state(CycleState::AwaitingProcess);
                self.launch(date).await;
            }
            (true, true) if self.state == CycleState::AwaitingProcess => {
                self.launch(now.date_naive()).await;
            }
            (true, false) => {
                info!("night ended");
                self.close_night(now.date_naive()).await;
            }
            _ => {}
        }
        self.was_night = night;
    }

    /// Fetches and compiles tonight's plan and starts imaging. Plan errors
    /// leave the controller awaiting and are retried on the next tick.
    async fn launch(&mut self, date: NaiveDate) {
        let sequence = match self.prepare_plan(date).await {
            Ok(Some(sequence)) => sequence,
            Ok(None) => {
                info!(date = %date, "no pending tasks tonight");
                self.set_state(CycleState::Idle);
                return;
            }
            Err(e) => {
                warn!(error = format!("{e:#}"), "failed to prepare night plan; retrying next tick");
                self.status.update(|s| s.error = Some(format!("{e:#}")));
                return;
            }
        };

        let sink = Arc::new(ImagingStatus {
            status: Arc::clone(&self.status),
        });
        if !self.supervisor.start(&sequence, sink) {
            // Not retried until the next night edge.
            self.status
                .update(|s| s.error = Some("failed to start imaging process".to_string()));
            self.set_state(CycleState::Idle);
            return;
        }

        match plan::task_ids(&sequence) {
            Ok(ids) => *lock(&self.active_tasks) = ids.into_iter().collect(),
            Err(e) => warn!(error = %e, "could not read task ids back from the sequence"),
        }
        info!(pid = ?self.supervisor.pid(), sequence = %sequence.display(), "imaging started");
        let plan_path = sequence.display().to_string();
        self.status.update(|s| {
            s.active_plan = Some(plan_path);
            s.error = None;
        });
        self.set_state(CycleState::ActiveImaging);
    }

    /// Returns the compiled sequence, or `None` when every task is done.
    async fn prepare_plan(&self, date: NaiveDate) -> Result<Option<PathBuf>> {
        let source = Arc::clone(&self.source);
        let compiler = Arc::clone(&self.compiler);
        let observatory_id = self.settings.observatory_id.clone();

        tokio::task::spawn_blocking(move || -> Result<Option<PathBuf>> {
            let tasks = source.fetch_night_plan(date)?;
            let pending: Vec<_> = tasks
                .into_iter()
                .filter(|task| match source.fetch_task_status(&task.task_id) {
                    Ok(status) => status != STATUS_COMPLETED,
                    Err(e) => {
                        warn!(task_id = %task.task_id, error = format!("{e:#}"), "task status unknown; keeping task");
                        true
                    }
                })
                .collect();
            if pending.is_empty() {
                return Ok(None);
            }
            info!(tasks = pending.len(), "pending tasks for tonight");
            let sequence = compiler.compile(&pending, &observatory_id, date)?;
            Ok(Some(sequence))
        })
        .await
        .context("plan preparation panicked")?
    }

    async fn on_process_status(&mut self, status: ProcessStatus) {
        if self.state != CycleState::ActiveImaging {
            return;
        }
        match status {
            ProcessStatus::Exited(Some(0)) => info!("imaging process exited cleanly"),
            ProcessStatus::Exited(code) => warn!(code = ?code, "imaging process exited"),
            ProcessStatus::KillFailed => error!("imaging process could not be killed"),
            _ => return,
        }
        self.close_night(Local::now().date_naive()).await;
    }

    /// Ends the night: fires `night_end` once and stops the imaging software.
    async fn close_night(&mut self, date: NaiveDate) {
        if matches!(self.state, CycleState::ActiveImaging | CycleState::AwaitingProcess) {
            self.set_state(CycleState::Draining);
        }
        if self.night_open {
            self.night_open = false;
            self.hooks.trigger(hooks::NIGHT_END, date_args(date));
        }
        if self.supervisor.is_running() {
            self.supervisor.stop().await;
        }
        lock(&self.active_tasks).clear();
        self.status.update(|s| s.active_plan = None);
        self.set_state(CycleState::Idle);
    }

    async fn shutdown_cleanup(&mut self) {
        info!(state = ?self.state(), "shutting down");
        self.set_state(CycleState::Draining);
        self.night_open = false;
        self.hooks
            .trigger(hooks::NIGHT_END, date_args(Local::now().date_naive()));
        self.supervisor.stop().await;
        debug!(imaging = ?self.supervisor.status(), "imaging process stopped");
        self.detector.stop().await;
        self.hooks.drain_all().await;
        info!("shutdown complete");
    }

    fn set_state(&mut self, state: CycleState) {
        if self.state != state {
            info!(from = ?self.state, to = ?state, "cycle state changed");
        }
        self.state = state;
        self.status.update(|s| s.state = state);
    }
}

fn date_args(date: NaiveDate) -> HookArgs {
    HookArgs::from([(
        "date".to_string(),
        HookValue::from(date.format("%Y-%m-%d").to_string()),
    )])
}

/// Logs imaging progress and keeps the latest line for the status file.
struct ImagingStatus {
    status: Arc<StatusBoard>,
}

impl StatusSink for ImagingStatus {
    fn on_status(&self, line: &str) -> Result<()> {
        info!(line, "imaging status");
        let line = line.to_string();
        self.status.note(|s| s.last_imaging_status = Some(line));
        Ok(())
    }
}

/// Reports each arrived frame as completed and queues the `post_task` hook.
struct ArrivalForwarder {
    source: Arc<dyn PlanSource>,
    hooks: Arc<HookDispatcher>,
    status: Arc<StatusBoard>,
    active_tasks: Arc<Mutex<HashSet<String>>>,
}

impl ArrivalHandler for ArrivalForwarder {
    fn on_arrival(&self, path: &Path) -> Result<()> {
        let task_id = plan::task_id_from_path(path)
            .with_context(|| format!("cannot derive a task id from {}", path.display()))?;
        info!(task_id = %task_id, path = %path.display(), "new frame");

        {
            let active = lock(&self.active_tasks);
            if !active.is_empty() && !active.contains(&task_id) {
                warn!(task_id = %task_id, "frame does not belong to the active plan");
            }
        }

        if let Err(e) = self
            .source
            .report_task_status(&task_id, STATUS_COMPLETED, &[path.to_path_buf()])
        {
            error!(task_id = %task_id, error = format!("{e:#}"), "failed to report task completion");
        }

        let file = path.display().to_string();
        self.status.update(|s| {
            s.last_file = Some(file);
            s.last_file_timestamp = Some(Local::now().to_rfc3339());
        });

        let args = HookArgs::from([
            ("task_id".to_string(), HookValue::from(task_id)),
            ("fits_file".to_string(), HookValue::from(path)),
        ]);
        self.hooks.trigger(hooks::POST_TASK, args);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
