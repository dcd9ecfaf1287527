// ============================================
// error.rs - Error taxonomy
// ============================================
//
// Errors fall into three groups:
//   - Configuration: bad input, rejected before any side effect
//   - Precondition:  the setup source can't be used; aborts the
//                    execute phase only (cleanup still runs)
//   - Best-effort:   power/mount/folder failures; logged as warnings
//
// A non-zero setup.exe exit code is NOT an error here. It is data
// that ends up in the status log.
// ============================================

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpgradeError {
    // ---------- Configuration ----------
    #[error("invalid dynamic update value '{0}' (expected Enable or Disable)")]
    InvalidDynamicUpdate(String),

    #[error("failed to load config file {path}: {reason}")]
    ConfigFile { path: PathBuf, reason: String },

    #[error("administrator rights are required; re-run from an elevated prompt")]
    NotElevated,

    // ---------- Precondition ----------
    #[error("setup source not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("unsupported setup source {0} (expected a folder or an .iso/.img/.vhd/.vhdx image)")]
    UnsupportedSource(PathBuf),

    #[error("failed to mount disk image {path}: {reason}")]
    MountFailed { path: PathBuf, reason: String },

    #[error("disk image {0} mounted but no volume with a drive letter appeared")]
    MountResolution(PathBuf),

    #[error("setup.exe not found at {0}")]
    SetupExecutableNotFound(PathBuf),

    #[error("failed to launch {path}: {source}")]
    LaunchFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ---------- Best-effort ----------
    #[error("failed to read power setting {setting}: {reason}")]
    PowerQuery { setting: &'static str, reason: String },

    #[error("failed to change power setting {setting}: {reason}")]
    PowerChange { setting: &'static str, reason: String },

    #[error("failed to dismount disk image {path}: {reason}")]
    Dismount { path: PathBuf, reason: String },

    #[error("{program} failed: {reason}")]
    CommandFailed { program: &'static str, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl UpgradeError {
    /// Wrap an I/O error with a short description of what we were doing.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        UpgradeError::Io {
            context: context.into(),
            source,
        }
    }

    /// True for errors that abort the execute phase (as opposed to
    /// best-effort failures that only produce a warning).
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            UpgradeError::SourceNotFound(_)
                | UpgradeError::UnsupportedSource(_)
                | UpgradeError::MountFailed { .. }
                | UpgradeError::MountResolution(_)
                | UpgradeError::SetupExecutableNotFound(_)
                | UpgradeError::LaunchFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, UpgradeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_classification() {
        assert!(UpgradeError::SourceNotFound(PathBuf::from("X:\\nope")).is_precondition());
        assert!(UpgradeError::MountResolution(PathBuf::from("a.iso")).is_precondition());
        assert!(!UpgradeError::NotElevated.is_precondition());
        assert!(!UpgradeError::PowerChange {
            setting: "standby-timeout-ac",
            reason: "access denied".to_string(),
        }
        .is_precondition());
    }
}
