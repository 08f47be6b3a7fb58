/// Default file locations for the runner.
///
/// Both files live in the working directory's `config/` folder unless
/// `HEVELIUS_HOME` points somewhere else:
///   - config.toml  Read by the runner at startup.
///   - status.toml  Written by the runner whenever its state changes.
use std::path::PathBuf;

const HOME_ENV_VAR: &str = "HEVELIUS_HOME";
const DEFAULT_HOME_DIR: &str = "config";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";

/// Returns the runner's home directory: `$HEVELIUS_HOME`, or `./config`.
pub fn home_dir() -> PathBuf {
    match std::env::var_os(HOME_ENV_VAR) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_HOME_DIR),
    }
}

/// Returns the default config file path: `<home>/config.toml`
pub fn config_file_path() -> PathBuf {
    home_dir().join(CONFIG_FILE_NAME)
}

/// Returns the default status file path: `<home>/status.toml`
pub fn status_file_path() -> PathBuf {
    home_dir().join(STATUS_FILE_NAME)
}
