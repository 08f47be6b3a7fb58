use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};

use crate::controller::CycleState;

/// Runtime status written by the runner to `status.toml`.
/// Operators and dashboards read this file to see what the runner is doing.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunnerStatus {
    /// Runner binary version (set from Cargo.toml at compile time).
    pub version: String,
    /// Current night-cycle state.
    pub state: CycleState,
    /// Sequence file the imaging software is running, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_plan: Option<String>,
    /// Most recent progress line printed by the imaging software.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_imaging_status: Option<String>,
    /// Absolute path of the most recently detected frame, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_file: Option<String>,
    /// RFC 3339 timestamp of the most recently detected frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_file_timestamp: Option<String>,
    /// Human-readable message for the last non-fatal error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunnerStatus {
    /// Constructs the initial idle status on startup.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: CycleState::Idle,
            active_plan: None,
            last_imaging_status: None,
            last_file: None,
            last_file_timestamp: None,
            error: None,
        }
    }
}

impl Default for RunnerStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Failures are logged; the runner keeps going without a status file.
pub fn write_status(path: &Path, status: &RunnerStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            error!(dir = %parent.display(), error = %e, "failed to create status directory");
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                error!(error = %e, "failed to write status file");
            }
        }
        Err(e) => error!(error = %e, "failed to serialize status"),
    }
}

/// Shared status snapshot, persisted on every [`update`](StatusBoard::update).
///
/// The snapshot lock is only held while the status is changed or copied.
/// File writes are serialized by a separate lock and always write the
/// latest snapshot, so the file never goes back to an older state.
pub struct StatusBoard {
    path: Option<PathBuf>,
    status: Mutex<RunnerStatus>,
    file: Mutex<()>,
}

impl StatusBoard {
    /// `None` keeps the status in memory only.
    pub fn new(path: Option<PathBuf>) -> Self {
        let board = Self {
            path,
            status: Mutex::new(RunnerStatus::new()),
            file: Mutex::new(()),
        };
        board.update(|_| {});
        board
    }

    /// Applies `change` and writes the result to disk.
    pub fn update(&self, change: impl FnOnce(&mut RunnerStatus)) {
        change(&mut *lock(&self.status));
        if let Some(path) = &self.path {
            let _file = lock(&self.file);
            write_status(path, &self.snapshot());
        }
    }

    /// Applies `change` without touching the file; used for chatty updates.
    pub fn note(&self, change: impl FnOnce(&mut RunnerStatus)) {
        change(&mut *lock(&self.status));
        debug!("status updated in memory");
    }

    pub fn snapshot(&self) -> RunnerStatus {
        lock(&self.status).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
