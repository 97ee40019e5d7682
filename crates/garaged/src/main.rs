mod board;
mod config;
mod controller;
mod event;
mod host;
mod journal;
mod queue;
mod trace;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::process::{Command, ExitCode, Stdio};
use std::{env, fs};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use controller::Controller;
use host::SysHost;
use journal::FileJournal;
use trace::JsonTrace;

const DEFAULT_CONFIG_PATH: &str = "/etc/garaged.toml";

/// Garage light controller daemon.
///
/// Reads its config from `$GARAGED_CONFIG`, else /etc/garaged.toml, else
/// built-in defaults.
#[derive(Parser)]
#[command(name = "garaged", version)]
struct Args {
    /// Detach and run in the background.
    #[arg(short, long)]
    daemon: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let result = if args.daemon { detach() } else { run() };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("garaged: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Re-launch this binary in the background without a terminal.
fn detach() -> Result<()> {
    let exe = env::current_exe().context("failed to locate own executable")?;
    println!("Starting garaged daemon...");
    let mut command = Command::new(&exe);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // Own process group: the terminal's job control no longer reaches it.
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut command, 0);
    let child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", exe.display()))?;
    info!(pid = child.id(), "daemon started");
    Ok(())
}

fn run() -> Result<()> {
    // ── Config ──────────────────────────────────────────────────────
    let explicit = env::var("GARAGED_CONFIG").ok();
    let cfg = config::load_or_default(explicit.as_deref(), DEFAULT_CONFIG_PATH)?;
    let pins = cfg.pin_map();
    let timings = cfg.timings();
    info!(?pins, "config loaded");

    // ── Operational log ─────────────────────────────────────────────
    let journal = match FileJournal::open(&cfg.log_path) {
        Ok(j) => j,
        Err(e) => {
            warn!("{e:#}; operational log goes to tracing only");
            FileJournal::disabled()
        }
    };

    // ── Board ───────────────────────────────────────────────────────
    #[cfg(feature = "gpio")]
    let board = board::RpiBoard::new(pins)?;
    #[cfg(not(feature = "gpio"))]
    let board = {
        warn!("built without the `gpio` feature; driving a mock board");
        board::MockBoard::new(pins)
    };

    let host = SysHost::new(cfg.reboot_command.clone());
    let mut controller = Controller::new(timings, pins, board, Box::new(journal), Box::new(host));

    // ── Queue trace ─────────────────────────────────────────────────
    if let Some(path) = cfg.trace_path.as_deref() {
        prepare_parent(path)?;
        let trace = JsonTrace::open(path, controller.queue().epoch())?;
        controller.queue().set_observer(Box::new(trace));
        info!(path = %path.display(), "queue trace enabled");
    }

    controller.run()?;
    info!(light = ?controller.light_mode(), "garaged stopped");
    Ok(())
}

fn prepare_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display())),
        _ => Ok(()),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
