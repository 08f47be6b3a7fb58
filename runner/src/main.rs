mod api;
mod config;
mod controller;
mod detector;
mod hooks;
mod logging;
mod paths;
mod plan;
mod process_tree;
mod status;
mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::api::HttpPlanSource;
use crate::config::{Config, LoggingConfig};
use crate::controller::{CycleSettings, HourWindow, NightCycleController};
use crate::detector::{DetectorSettings, FileArrivalDetector};
use crate::hooks::{EntryPoints, HookDispatcher};
use crate::logging::RotatingFile;
use crate::plan::JsonTemplateCompiler;
use crate::process_tree::SysinfoTree;
use crate::status::StatusBoard;
use crate::supervisor::ProcessSupervisor;

/// Unattended night-cycle runner for a robotic telescope.
#[derive(Parser, Debug)]
#[command(name = "hevelius-runner", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print the effective configuration and exit.
    #[arg(long)]
    check_config: bool,
}

/// Console output on stderr, plus the rotating log file when `file` is set.
/// A log file that cannot be opened is reported once logging is up.
fn init_logging(verbose: u8, file: Option<&LoggingConfig>) -> Option<anyhow::Error> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hevelius_runner={level}")));

    let (file_layer, file_error) = match file.map(RotatingFile::from_config) {
        Some(Ok(writer)) => (
            Some(fmt::layer().with_target(false).with_ansi(false).with_writer(writer)),
            None,
        ),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    file_error
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Configuration ─────────────────────────────────────────────────────────
    // Loaded before logging so the log file location comes from the config.
    let config_path = cli.config.unwrap_or_else(paths::config_file_path);
    let (config, config_error) = match config::load_or_default(&config_path) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };

    let log_file = (config.logging.file && !cli.check_config).then_some(&config.logging);
    if let Some(e) = init_logging(cli.verbose, log_file) {
        warn!(error = format!("{e:#}"), "log file unavailable; logging to the console only");
    }
    if let Some(e) = config_error {
        error!(path = %config_path.display(), error = format!("{e:#}"), "invalid config, using defaults");
    }

    if cli.check_config {
        let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
        println!("{rendered}");
        return Ok(());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "hevelius-runner starting"
    );

    // ── Collaborators ─────────────────────────────────────────────────────────
    let source = Arc::new(HttpPlanSource::new(&config.api)?);
    {
        let source = Arc::clone(&source);
        match tokio::task::spawn_blocking(move || source.version()).await? {
            Ok(version) => info!(version = %version, "backend reachable"),
            Err(e) => warn!(error = format!("{e:#}"), "backend not reachable; will retry on each cycle"),
        }
    }
    let compiler = Arc::new(JsonTemplateCompiler::new(
        &config.paths.template_dir,
        &config.paths.output_dir,
    ));

    // ── Core components ───────────────────────────────────────────────────────
    let supervisor = Arc::new(ProcessSupervisor::new(
        &config.imaging.executable_path,
        config.imaging.terminate_timeout(),
        Arc::new(SysinfoTree::new()),
    ));
    let detector = FileArrivalDetector::new(DetectorSettings::from(&config.monitor));
    let hooks = Arc::new(HookDispatcher::start(&config.hooks, EntryPoints::builtin()));

    let status_path = config
        .paths
        .status_file
        .clone()
        .unwrap_or_else(paths::status_file_path);
    let status = Arc::new(StatusBoard::new(Some(status_path)));

    let (start, end) = config.cycle.night_window();
    let controller = NightCycleController::new(
        CycleSettings::from(&config),
        Box::new(HourWindow::new(start, end)),
        source,
        compiler,
        supervisor,
        detector,
        hooks,
        status,
    );

    // Graceful shutdown on Ctrl+C.
    {
        let handle = controller.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                handle.shutdown();
            }
        });
    }

    controller.run().await;
    Ok(())
}
