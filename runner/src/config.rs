use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5000/api/";
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_EXECUTABLE_PATH: &str = "NINA.exe";
pub const DEFAULT_TERMINATE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FILE_EXTENSION: &str = ".fits";
pub const DEFAULT_STABILITY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STABILITY_POLL_MS: u64 = 1000;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const MIN_POLL_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_OBSERVATORY_ID: &str = "default";
pub const DEFAULT_NIGHT_START_HOUR: u32 = 18;
pub const DEFAULT_NIGHT_END_HOUR: u32 = 7;
pub const DEFAULT_LOG_FILE_NAME: &str = "observatory.log";
pub const DEFAULT_LOG_MAX_BYTES: u64 = 1024 * 1024;
pub const DEFAULT_LOG_BACKUPS: usize = 5;

/// Root configuration structure, deserialized from `config.toml`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub imaging: ImagingConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Hook scripts keyed by hook type (`startup`, `night_start`, `night_end`,
    /// `post_task`, or any custom name).
    #[serde(default)]
    pub hooks: BTreeMap<String, HookConfig>,
}

/// Connection settings for the task API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
    /// Sent as `Authorization: Bearer <token>` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Extra scope filter forwarded to the night-plan request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<u32>,
    /// Set to `false` to accept any server certificate (self-signed backends).
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            timeout_secs: DEFAULT_API_TIMEOUT_SECS,
            token: None,
            scope_id: None,
            verify_ssl: true,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Filesystem locations used by the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding `<observatory_id>_template.json` sequence templates.
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,
    /// Directory generated sequence files are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Directory the imaging software saves its frames into.
    #[serde(default = "default_fits_monitor_dir")]
    pub fits_monitor_dir: PathBuf,
    /// Overrides the default status file location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_file: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            template_dir: default_template_dir(),
            output_dir: default_output_dir(),
            fits_monitor_dir: default_fits_monitor_dir(),
            status_file: None,
        }
    }
}

/// The supervised imaging-control executable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagingConfig {
    #[serde(default = "default_executable_path")]
    pub executable_path: PathBuf,
    /// How long `stop` waits for a graceful exit before killing the tree.
    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout_secs: u64,
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            executable_path: default_executable_path(),
            terminate_timeout_secs: DEFAULT_TERMINATE_TIMEOUT_SECS,
        }
    }
}

impl ImagingConfig {
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

/// File arrival detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Matched case-insensitively against the end of the file name.
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
    #[serde(default = "default_stability_timeout")]
    pub stability_timeout_secs: u64,
    #[serde(default = "default_stability_poll")]
    pub stability_poll_ms: u64,
    /// Report files already present in the monitor directory at startup.
    #[serde(default = "default_true")]
    pub process_existing: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            file_extension: default_file_extension(),
            stability_timeout_secs: DEFAULT_STABILITY_TIMEOUT_SECS,
            stability_poll_ms: DEFAULT_STABILITY_POLL_MS,
            process_existing: true,
        }
    }
}

impl MonitorConfig {
    pub fn stability_timeout(&self) -> Duration {
        Duration::from_secs(self.stability_timeout_secs)
    }

    pub fn stability_poll(&self) -> Duration {
        Duration::from_millis(self.stability_poll_ms.max(1))
    }
}

/// Night-cycle loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Seconds between night/day evaluations. Clamped to at least one second.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_observatory_id")]
    pub observatory_id: String,
    /// Local hour at which the night begins (inclusive).
    #[serde(default = "default_night_start_hour")]
    pub night_start_hour: u32,
    /// Local hour at which the night ends (exclusive).
    #[serde(default = "default_night_end_hour")]
    pub night_end_hour: u32,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            observatory_id: default_observatory_id(),
            night_start_hour: DEFAULT_NIGHT_START_HOUR,
            night_end_hour: DEFAULT_NIGHT_END_HOUR,
        }
    }
}

impl CycleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(MIN_POLL_INTERVAL_SECS))
    }

    /// Returns `(start, end)` with both hours wrapped into `0..24`.
    pub fn night_window(&self) -> (u32, u32) {
        (self.night_start_hour % 24, self.night_end_hour % 24)
    }
}

/// Log file settings. Console output is always on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Set to `false` to log to the console only.
    #[serde(default = "default_true")]
    pub file: bool,
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_log_file_name")]
    pub file_name: String,
    /// The file is rotated once it would grow past this size.
    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: u64,
    /// Rotated files kept as `<file_name>.1` ... `<file_name>.<backups>`.
    #[serde(default = "default_log_backups")]
    pub backups: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: true,
            dir: default_log_dir(),
            file_name: default_log_file_name(),
            max_bytes: DEFAULT_LOG_MAX_BYTES,
            backups: DEFAULT_LOG_BACKUPS,
        }
    }
}

/// How a hook script is run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    /// Spawned as a subprocess with the arguments flattened to flags.
    #[default]
    External,
    /// A named entry point registered inside the runner.
    InProcess,
}

/// Configuration entry for a single hook type.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    /// Script to execute. Required for external hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub kind: HookKind,
    /// Entry point name for in-process hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_api_timeout() -> u64 {
    DEFAULT_API_TIMEOUT_SECS
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("templates")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("sequences")
}

fn default_fits_monitor_dir() -> PathBuf {
    PathBuf::from("fits")
}

fn default_executable_path() -> PathBuf {
    PathBuf::from(DEFAULT_EXECUTABLE_PATH)
}

fn default_terminate_timeout() -> u64 {
    DEFAULT_TERMINATE_TIMEOUT_SECS
}

fn default_file_extension() -> String {
    DEFAULT_FILE_EXTENSION.to_string()
}

fn default_stability_timeout() -> u64 {
    DEFAULT_STABILITY_TIMEOUT_SECS
}

fn default_stability_poll() -> u64 {
    DEFAULT_STABILITY_POLL_MS
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_observatory_id() -> String {
    DEFAULT_OBSERVATORY_ID.to_string()
}

fn default_night_start_hour() -> u32 {
    DEFAULT_NIGHT_START_HOUR
}

fn default_night_end_hour() -> u32 {
    DEFAULT_NIGHT_END_HOUR
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_file_name() -> String {
    DEFAULT_LOG_FILE_NAME.to_string()
}

fn default_log_max_bytes() -> u64 {
    DEFAULT_LOG_MAX_BYTES
}

fn default_log_backups() -> usize {
    DEFAULT_LOG_BACKUPS
}
