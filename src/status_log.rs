// ============================================
// status_log.rs - Append-only run history
// ============================================
//
// Every run that gets as far as setup.exe exiting adds ONE line:
//
//   [2026-10-19T17:41:00+02:00] ExitCode=0 (DynamicUpdate=Disable)
//
// The file is never truncated, so it doubles as a history of every
// upgrade attempt on this machine.
// ============================================

use chrono::{DateTime, FixedOffset, Local, SecondsFormat};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::config::DynamicUpdate;
use crate::error::{Result, UpgradeError};

/// Outcome of one setup.exe run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub timestamp: DateTime<FixedOffset>,
    pub exit_code: i32,
    pub dynamic_update: DynamicUpdate,
}

impl RunResult {
    /// Stamp a result with the current local time.
    pub fn now(exit_code: i32, dynamic_update: DynamicUpdate) -> Self {
        RunResult {
            timestamp: Local::now().fixed_offset(),
            exit_code,
            dynamic_update,
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "[{}] ExitCode={} (DynamicUpdate={})",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, false),
            self.exit_code,
            self.dynamic_update
        )
    }

    /// Parse a line written by `to_line`. Returns None for anything else.
    pub fn parse_line(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix('[')?;
        let (stamp, rest) = rest.split_once(']')?;
        let rest = rest.trim().strip_prefix("ExitCode=")?;
        let (code, rest) = rest.split_once(' ')?;
        let mode = rest
            .trim()
            .strip_prefix("(DynamicUpdate=")?
            .strip_suffix(')')?;

        Some(RunResult {
            timestamp: DateTime::parse_from_rfc3339(stamp).ok()?,
            exit_code: code.parse().ok()?,
            dynamic_update: mode.parse().ok()?,
        })
    }
}

/// The status file on disk.
#[derive(Debug, Clone)]
pub struct StatusLog {
    path: PathBuf,
}

impl StatusLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StatusLog { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add one line to the end of the file, creating it if needed.
    pub fn append(&self, result: &RunResult) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                UpgradeError::io(format!("failed to create {}", parent.display()), e)
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| UpgradeError::io(format!("failed to open {}", self.path.display()), e))?;

        writeln!(file, "{}", result.to_line())
            .map_err(|e| UpgradeError::io(format!("failed to write {}", self.path.display()), e))
    }

    /// Every recorded run, oldest first. Lines that don't parse are skipped.
    /// A missing file is an empty history.
    pub fn read_all(&self) -> Result<Vec<RunResult>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(UpgradeError::io(
                    format!("failed to read {}", self.path.display()),
                    e,
                ))
            }
        };

        Ok(content.lines().filter_map(RunResult::parse_line).collect())
    }
}
