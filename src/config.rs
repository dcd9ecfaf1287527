// ============================================
// config.rs - Run configuration
// ============================================
//
// Where each setting comes from (later wins):
//   1. Built-in defaults (paths on the system drive)
//   2. Optional TOML config file (--config)
//   3. Command line flags
//
// Everything here is validated BEFORE the orchestrator touches
// the machine. An invalid dynamic update value never gets as far
// as powercfg or setup.exe.
//
// Example config file:
//
//   source = 'D:\Media\Win11_24H2.iso'
//   dynamic_update = "Disable"
//   log_dir = 'C:\Win11UpgradeLogs'
// ============================================

use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, UpgradeError};

// ============================================
// CONSTANTS
// ============================================

/// Final path segment of the working folder. Cleanup only ever deletes a
/// directory with exactly this name (compared case-insensitively).
pub const MARKER_FOLDER_NAME: &str = "Win11Upgrade";

/// Default image file name inside the working folder.
const DEFAULT_IMAGE_NAME: &str = "Win11.iso";

/// Folder on the system drive that receives setup's /CopyLogs output.
const LOG_FOLDER_NAME: &str = "Win11UpgradeLogs";

/// Append-only status file on the system drive.
const STATUS_LOG_NAME: &str = "Win11Upgrade_Status.log";

/// The system drive (e.g. "C:"), from the SystemDrive environment variable.
/// Falls back to C: when the variable is missing.
pub fn system_drive() -> String {
    std::env::var("SystemDrive")
        .ok()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| "C:".to_string())
}

// ============================================
// DYNAMIC UPDATE MODE
// ============================================

/// Whether setup.exe may download newer setup components during the upgrade.
///
/// Defaults to `Disable`: with dynamic update enabled, setup has been seen to
/// stall at a fixed completion percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum DynamicUpdate {
    Enable,
    #[default]
    Disable,
}

impl fmt::Display for DynamicUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynamicUpdate::Enable => write!(f, "Enable"),
            DynamicUpdate::Disable => write!(f, "Disable"),
        }
    }
}

impl FromStr for DynamicUpdate {
    type Err = UpgradeError;

    fn from_str(s: &str) -> Result<Self> {
        let value = s.trim();
        if value.eq_ignore_ascii_case("enable") {
            Ok(DynamicUpdate::Enable)
        } else if value.eq_ignore_ascii_case("disable") {
            Ok(DynamicUpdate::Disable)
        } else {
            Err(UpgradeError::InvalidDynamicUpdate(s.to_string()))
        }
    }
}

impl TryFrom<String> for DynamicUpdate {
    type Error = UpgradeError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

// ============================================
// CONFIG FILE
// ============================================

/// Settings read from a TOML config file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub source: Option<PathBuf>,
    pub dynamic_update: Option<DynamicUpdate>,
    pub working_folder: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub status_log: Option<PathBuf>,
}

impl FileConfig {
    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| UpgradeError::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &Path, content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| UpgradeError::ConfigFile {
            path: path.to_path_buf(),
            // toml errors span several lines; keep the log readable
            reason: e.message().to_string(),
        })
    }
}

// ============================================
// RESOLVED CONFIG
// ============================================

/// Final settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeConfig {
    /// ISO/IMG/VHD(X) image or a folder containing setup.exe
    pub source: PathBuf,
    pub dynamic_update: DynamicUpdate,
    /// Deleted after a successful upgrade (only if named MARKER_FOLDER_NAME)
    pub working_folder: PathBuf,
    /// Passed to setup.exe as /CopyLogs
    pub log_dir: PathBuf,
    /// One line appended per run
    pub status_log: PathBuf,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        let drive = system_drive();
        let working_folder = PathBuf::from(format!("{}\\{}", drive, MARKER_FOLDER_NAME));

        UpgradeConfig {
            source: working_folder.join(DEFAULT_IMAGE_NAME),
            dynamic_update: DynamicUpdate::default(),
            working_folder,
            log_dir: PathBuf::from(format!("{}\\{}", drive, LOG_FOLDER_NAME)),
            status_log: PathBuf::from(format!("{}\\{}", drive, STATUS_LOG_NAME)),
        }
    }
}

impl UpgradeConfig {
    /// Layer config file values over the defaults.
    pub fn with_file(mut self, file: FileConfig) -> Self {
        if let Some(source) = file.source {
            self.source = source;
        }
        if let Some(mode) = file.dynamic_update {
            self.dynamic_update = mode;
        }
        if let Some(folder) = file.working_folder {
            self.working_folder = folder;
        }
        if let Some(dir) = file.log_dir {
            self.log_dir = dir;
        }
        if let Some(log) = file.status_log {
            self.status_log = log;
        }
        self
    }
}

// ============================================
// TESTS
// ============================================
