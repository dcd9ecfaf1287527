// ============================================
// orchestrator.rs - The upgrade run, start to finish
// ============================================
//
// A run has three phases, always in this order:
//
//   1. PREPARE  - capture power timeouts, then disable sleep/hibernate
//   2. EXECUTE  - resolve the source, run setup.exe, append to status log
//   3. CLEANUP  - dismount the image, restore power timeouts, and
//                 (only after exit code 0) delete the working folder
//
// CLEANUP runs no matter what happened in EXECUTE. Only a bad source
// (missing path, mount problem, no setup.exe) stops EXECUTE early;
// every other failure is a warning and the run keeps going.
//
// The power snapshot and the setup source are passed from phase to
// phase as plain values. Nothing is stored in globals.
// ============================================

use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

use crate::config::{UpgradeConfig, MARKER_FOLDER_NAME};
use crate::error::{Result, UpgradeError};
use crate::launcher::{SetupRunner, UpgradeLauncher};
use crate::power::{PowerBackend, PowerController, PowerTimeoutSnapshot};
use crate::source::{DiskImageBackend, SetupSource, SourceResolver};
use crate::status_log::{RunResult, StatusLog};

// ============================================
// BEST-EFFORT STEPS
// ============================================

/// Collects failures from steps that must not stop the run.
#[derive(Debug, Default)]
pub struct Warnings {
    items: Vec<String>,
}

impl Warnings {
    /// Run a step. On failure, log and remember the error and return None.
    pub fn attempt<T>(&mut self, step: &str, f: impl FnOnce() -> Result<T>) -> Option<T> {
        match f() {
            Ok(value) => Some(value),
            Err(e) => {
                self.record(step, &e);
                None
            }
        }
    }

    pub fn record(&mut self, step: &str, err: &UpgradeError) {
        warn!("[Warning] {}: {}", step, err);
        self.items.push(format!("{}: {}", step, err));
    }

    pub fn record_all(&mut self, step: &str, errors: Vec<UpgradeError>) {
        for e in &errors {
            self.record(step, e);
        }
    }

    pub fn note(&mut self, message: String) {
        warn!("[Warning] {}", message);
        self.items.push(message);
    }

    pub fn into_vec(self) -> Vec<String> {
        self.items
    }
}

// ============================================
// WORKING FOLDER GUARD
// ============================================

/// Does the folder's last path segment equal the marker name?
pub fn is_marker_folder(folder: &Path) -> bool {
    folder
        .file_name()
        .map(|name| name.to_string_lossy().eq_ignore_ascii_case(MARKER_FOLDER_NAME))
        .unwrap_or(false)
}

/// The working folder is deleted only after a clean exit (code 0), and
/// only when it's really our folder.
pub fn should_remove_working_folder(exit_code: Option<i32>, folder: &Path) -> bool {
    exit_code == Some(0) && is_marker_folder(folder)
}

// ============================================
// ORCHESTRATOR
// ============================================

/// The machine-facing collaborators of a run.
#[derive(Clone, Copy)]
pub struct Backends<'a> {
    pub power: &'a dyn PowerBackend,
    pub images: &'a dyn DiskImageBackend,
    pub setup: &'a dyn SetupRunner,
}

/// What happened during a run.
#[derive(Debug)]
pub struct RunOutcome {
    /// setup.exe exit code; None if setup never ran to completion
    pub exit_code: Option<i32>,
    /// The error that stopped the execute phase, if any
    pub error: Option<UpgradeError>,
    pub folder_removed: bool,
    pub warnings: Vec<String>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub struct Orchestrator<'a> {
    config: &'a UpgradeConfig,
    backends: Backends<'a>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a UpgradeConfig, backends: Backends<'a>) -> Self {
        Orchestrator { config, backends }
    }

    /// Run all three phases.
    pub fn run(&self) -> RunOutcome {
        let mut warnings = Warnings::default();

        // ============================================
        // PHASE 1: Prepare
        // ============================================
        let snapshot = self.prepare(&mut warnings);

        // ============================================
        // PHASE 2: Execute
        // ============================================
        let mut source = None;
        let (exit_code, error) = match self.execute(&mut source, &mut warnings) {
            Ok(code) => (Some(code), None),
            Err(e) => {
                error!("[Upgrade] Aborted before setup finished: {}", e);
                (None, Some(e))
            }
        };

        // ============================================
        // PHASE 3: Cleanup
        // ============================================
        let folder_removed = self.cleanup(source, &snapshot, exit_code, &mut warnings);

        let warnings = warnings.into_vec();
        if !warnings.is_empty() {
            warn!("[Upgrade] Finished with {} warning(s)", warnings.len());
        }

        RunOutcome {
            exit_code,
            error,
            folder_removed,
            warnings,
        }
    }

    fn prepare(&self, warnings: &mut Warnings) -> PowerTimeoutSnapshot {
        info!("[Upgrade] Preparing: keeping the machine awake during setup");
        let power = PowerController::new(self.backends.power);

        let snapshot = power.capture();
        let missing = snapshot.missing();
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|s| s.change_flag()).collect();
            warnings.note(format!(
                "could not read power timeouts ({}); they will not be restored",
                names.join(", ")
            ));
        }

        warnings.record_all("disable sleep/hibernate", power.disable_all());
        snapshot
    }

    /// Resolve, launch, record. The resolved source is left in `slot` so
    /// cleanup can release its mount even if launching fails.
    fn execute(
        &self,
        slot: &mut Option<SetupSource<'a>>,
        warnings: &mut Warnings,
    ) -> Result<i32> {
        let config = self.config;
        info!("[Upgrade] Resolving setup source {}", config.source.display());

        let resolved = SourceResolver::new(self.backends.images).resolve(&config.source)?;
        let source = slot.insert(resolved);
        if source.is_mounted() {
            info!("[Upgrade] Running setup from mounted image at {}", source.root.display());
        }

        let exit_code = UpgradeLauncher::new(self.backends.setup).launch(
            &source.setup_exe,
            config.dynamic_update,
            &config.log_dir,
        )?;

        let result = RunResult::now(exit_code, config.dynamic_update);
        let log = StatusLog::new(&config.status_log);
        if warnings
            .attempt("record run result", || log.append(&result))
            .is_some()
        {
            info!("[Upgrade] Recorded to {}: {}", log.path().display(), result.to_line());
        }

        Ok(exit_code)
    }

    /// Every sub-step runs even if an earlier one failed.
    /// Returns true if the working folder was deleted.
    fn cleanup(
        &self,
        source: Option<SetupSource<'a>>,
        snapshot: &PowerTimeoutSnapshot,
        exit_code: Option<i32>,
        warnings: &mut Warnings,
    ) -> bool {
        info!("[Cleanup] Starting cleanup");

        // Dismount first: the image may live inside the working folder
        if let Some(mut source) = source {
            if let Some(Err(e)) = source.release_mount() {
                warnings.record("dismount image", &e);
            }
        }

        let power = PowerController::new(self.backends.power);
        warnings.record_all("restore power settings", power.restore(snapshot));
        info!("[Cleanup] Power settings restored where captured");

        self.remove_working_folder(exit_code, warnings)
    }

    fn remove_working_folder(&self, exit_code: Option<i32>, warnings: &mut Warnings) -> bool {
        let folder = &self.config.working_folder;

        if exit_code != Some(0) {
            info!("[Cleanup] Keeping {} (setup did not exit with 0)", folder.display());
            return false;
        }

        if !should_remove_working_folder(exit_code, folder) {
            warnings.note(format!(
                "refusing to delete {}: folder name is not '{}'",
                folder.display(),
                MARKER_FOLDER_NAME
            ));
            return false;
        }

        if !folder.exists() {
            info!("[Cleanup] {} is already gone", folder.display());
            return false;
        }

        info!("[Cleanup] Removing {}", folder.display());
        warnings
            .attempt("remove working folder", || {
                fs::remove_dir_all(folder).map_err(|e| {
                    UpgradeError::io(format!("failed to remove {}", folder.display()), e)
                })
            })
            .is_some()
    }
}

// ============================================
// TESTS
// ============================================
