// ============================================
// Win11 Upgrade Runner - main.rs
// ============================================
// This is the entry point of the application.
//
// The program flow is:
// 1. main() parses the command line
// 2. Logging is set up (stderr, --verbose for debug output)
// 3. The chosen command runs:
//      run    - the full unattended upgrade (default)
//      status - show the recorded upgrade history
//      power  - show the current sleep/hibernate timeouts
// 4. The process exits with setup.exe's exit code (run) or 0/1
// ============================================

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// Our modules
mod config; // Defaults, config file, dynamic update mode
mod error; // Error taxonomy
mod launcher; // setup.exe launch and wait
mod orchestrator; // Prepare / execute / cleanup sequence
mod power; // Sleep/hibernate timeouts via powercfg
mod source; // Folder or disk image -> setup.exe
mod status_log; // Append-only run history

use config::{DynamicUpdate, FileConfig, UpgradeConfig};
use error::UpgradeError;
use launcher::ProcessRunner;
use orchestrator::{Backends, Orchestrator};
use power::{PowerController, Powercfg};
use source::PowerShellDiskImages;
use status_log::StatusLog;

// ============================================
// COMMAND LINE
// ============================================

#[derive(Parser, Debug)]
#[command(name = "win11-upgrade", version)]
#[command(
    about = "Unattended in-place Windows 11 upgrade",
    long_about = "Keeps the machine awake, runs Windows Setup from an ISO or folder, \
                  records the exit code and restores power settings afterwards."
)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Show debug output
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    // `win11-upgrade --source X` is the same as `win11-upgrade run --source X`
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the upgrade (default)
    Run(RunArgs),
    /// Show recorded upgrade attempts
    Status {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        status_log: Option<PathBuf>,
        /// How many of the most recent runs to show
        #[arg(long, default_value_t = 10)]
        last: usize,
    },
    /// Show the current sleep/hibernate timeouts
    Power,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// ISO/IMG/VHD(X) image, or a folder containing setup.exe
    #[arg(long)]
    source: Option<PathBuf>,

    /// Let setup download updates during the upgrade (Enable or Disable)
    #[arg(long, value_parser = parse_dynamic_update)]
    dynamic_update: Option<DynamicUpdate>,

    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Folder deleted after a successful upgrade (must be named Win11Upgrade)
    #[arg(long)]
    working_folder: Option<PathBuf>,

    /// Where setup copies its logs (/CopyLogs)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Append-only status file
    #[arg(long)]
    status_log: Option<PathBuf>,
}

fn parse_dynamic_update(value: &str) -> std::result::Result<DynamicUpdate, UpgradeError> {
    value.parse()
}

// ============================================
// MAIN FUNCTION
// ============================================

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        None => run_upgrade(cli.run),
        Some(Commands::Run(args)) => run_upgrade(args),
        Some(Commands::Status {
            config,
            status_log,
            last,
        }) => show_status(config.as_deref(), status_log, last).map(|_| 0),
        Some(Commands::Power) => show_power().map(|_| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

/// Log to stderr. RUST_LOG overrides the level if set.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================
// COMMANDS
// ============================================

/// Defaults, then config file, then command line flags.
fn load_config(args: RunArgs) -> Result<UpgradeConfig> {
    let mut config = UpgradeConfig::default();

    if let Some(path) = &args.config {
        let file = FileConfig::load(path)?;
        config = config.with_file(file);
    }

    if let Some(source) = args.source {
        config.source = source;
    }
    if let Some(mode) = args.dynamic_update {
        config.dynamic_update = mode;
    }
    if let Some(folder) = args.working_folder {
        config.working_folder = folder;
    }
    if let Some(dir) = args.log_dir {
        config.log_dir = dir;
    }
    if let Some(log) = args.status_log {
        config.status_log = log;
    }
    Ok(config)
}

/// The full upgrade. Returns setup.exe's exit code.
fn run_upgrade(args: RunArgs) -> Result<i32> {
    // Everything that can be rejected is rejected before we touch the machine
    let config = load_config(args).context("invalid configuration")?;
    ensure_supported()?;
    if !is_elevated() {
        return Err(UpgradeError::NotElevated.into());
    }
    if detect_winpe_environment() {
        anyhow::bail!("running in WinPE; an in-place upgrade needs a running Windows installation");
    }

    info!("============================================");
    info!("Win11 Upgrade Runner v{}", env!("CARGO_PKG_VERSION"));
    info!("============================================");
    info!("Source: {}", config.source.display());
    info!("Dynamic update: {}", config.dynamic_update);
    info!("Setup logs: {}", config.log_dir.display());
    info!("Status log: {}", config.status_log.display());

    let backends = Backends {
        power: &Powercfg,
        images: &PowerShellDiskImages,
        setup: &ProcessRunner,
    };
    let outcome = Orchestrator::new(&config, backends).run();

    let succeeded = outcome.succeeded();
    for warning in &outcome.warnings {
        warn!("  - {}", warning);
    }

    if let Some(e) = outcome.error {
        let stage = if e.is_precondition() {
            "setup source check failed"
        } else {
            "upgrade aborted"
        };
        return Err(anyhow::Error::new(e).context(stage));
    }

    let code = outcome
        .exit_code
        .context("setup finished without an exit code")?;

    if succeeded {
        info!("Upgrade completed successfully. Reboot to finish installing Windows 11.");
    } else {
        warn!(
            "Windows Setup exited with code {} (0x{:X}); see {} for details",
            code,
            code,
            config.log_dir.display()
        );
    }
    Ok(code)
}

/// Print the last `last` entries of the status log.
fn show_status(config_path: Option<&Path>, status_log: Option<PathBuf>, last: usize) -> Result<()> {
    let mut config = UpgradeConfig::default();
    if let Some(path) = config_path {
        config = config.with_file(FileConfig::load(path)?);
    }
    let log = StatusLog::new(status_log.unwrap_or(config.status_log));

    let history = log.read_all()?;
    if history.is_empty() {
        println!("No upgrade runs recorded in {}", log.path().display());
        return Ok(());
    }

    let skip = history.len().saturating_sub(last);
    for run in &history[skip..] {
        let verdict = if run.exit_code == 0 { "ok" } else { "failed" };
        println!("{}  0x{:08X}  {}", run.to_line(), run.exit_code, verdict);
    }
    Ok(())
}

fn show_power() -> Result<()> {
    ensure_supported()?;
    let snapshot = PowerController::new(&Powercfg).capture();
    if snapshot.is_empty() {
        anyhow::bail!("could not read any power timeouts from powercfg");
    }
    println!("{}", snapshot);
    Ok(())
}

// ============================================
// HELPER FUNCTIONS
// ============================================

#[cfg(windows)]
fn ensure_supported() -> Result<()> {
    Ok(())
}

#[cfg(not(windows))]
fn ensure_supported() -> Result<()> {
    anyhow::bail!("this tool only runs on Windows")
}

/// Is this process running with an administrator token?
#[cfg(windows)]
fn is_elevated() -> bool {
    // SAFETY: IsUserAnAdmin takes no arguments and only inspects the process token
    unsafe { winapi::um::shlobj::IsUserAnAdmin() != 0 }
}

#[cfg(not(windows))]
fn is_elevated() -> bool {
    false
}

/// Detect if we're running in a WinPE environment.
/// Setup's /Auto Upgrade only works from a live Windows install.
fn detect_winpe_environment() -> bool {
    // WinPE boots with X: as its system drive. A bare X:\Windows folder is
    // not enough on its own: a live install can have a second disk on X:.
    if config::system_drive().eq_ignore_ascii_case("X:") {
        return true;
    }
    winpe_markers_present(Path::new("X:\\"))
}

/// WinPE shell files under `<root>\Windows\System32`.
fn winpe_markers_present(root: &Path) -> bool {
    let system32 = root.join("Windows").join("System32");
    ["winpeshl.ini", "startnet.cmd"]
        .iter()
        .any(|m| system32.join(m).exists())
}
