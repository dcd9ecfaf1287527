// ============================================
// launcher.rs - Run Windows Setup
// ============================================
//
// Launches setup.exe for an unattended in-place upgrade:
//
//   setup.exe /Auto Upgrade /Quiet /EULA Accept /NoReboot
//             /DynamicUpdate Disable /Telemetry Disable
//             /CopyLogs C:\Win11UpgradeLogs
//
// and waits for it. This is the one long blocking step (often an
// hour or more). There is no timeout: if setup hangs, someone has
// to kill it by hand.
//
// The exit code is passed back untouched. 0 = success, anything else
// is a setup-defined code (e.g. 3010 = reboot required,
// 0xC1900208 = incompatible app found) for a human to look up.
// ============================================

use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::info;

use crate::config::DynamicUpdate;
use crate::error::{Result, UpgradeError};

/// Build the fixed setup.exe argument list.
pub fn setup_arguments(mode: DynamicUpdate, log_dir: &Path) -> Vec<String> {
    vec![
        "/Auto".to_string(),
        "Upgrade".to_string(),
        "/Quiet".to_string(),
        "/EULA".to_string(),
        "Accept".to_string(),
        "/NoReboot".to_string(),
        "/DynamicUpdate".to_string(),
        mode.to_string(),
        "/Telemetry".to_string(),
        "Disable".to_string(),
        "/CopyLogs".to_string(),
        log_dir.display().to_string(),
    ]
}

/// Something that can run setup.exe and wait for it.
pub trait SetupRunner {
    /// Run to completion and return the exit code.
    fn run(&self, exe: &Path, args: &[String]) -> Result<i32>;
}

/// Runs setup.exe as a real child process.
pub struct ProcessRunner;

impl SetupRunner for ProcessRunner {
    fn run(&self, exe: &Path, args: &[String]) -> Result<i32> {
        let mut child = Command::new(exe)
            .args(args)
            .spawn()
            .map_err(|e| UpgradeError::LaunchFailed {
                path: exe.to_path_buf(),
                source: e,
            })?;

        info!("[Setup] setup.exe launched (PID: {})", child.id());

        // Blocks until setup exits. This can take hours.
        let status = child.wait().map_err(|e| UpgradeError::LaunchFailed {
            path: exe.to_path_buf(),
            source: e,
        })?;

        // No code means the process was terminated from outside
        Ok(status.code().unwrap_or(-1))
    }
}

/// Launches setup.exe with the unattended upgrade arguments.
pub struct UpgradeLauncher<'a> {
    runner: &'a dyn SetupRunner,
}

impl<'a> UpgradeLauncher<'a> {
    pub fn new(runner: &'a dyn SetupRunner) -> Self {
        UpgradeLauncher { runner }
    }

    /// Create the log folder, run setup and return its exit code verbatim.
    pub fn launch(&self, setup_exe: &Path, mode: DynamicUpdate, log_dir: &Path) -> Result<i32> {
        fs::create_dir_all(log_dir).map_err(|e| {
            UpgradeError::io(format!("failed to create log folder {}", log_dir.display()), e)
        })?;

        let args = setup_arguments(mode, log_dir);
        info!("[Setup] Launching Windows Setup...");
        info!("[Setup]   setup.exe: {}", setup_exe.display());
        info!("[Setup]   arguments: {}", args.join(" "));
        info!("[Setup] Windows Setup is running... This will take a while.");

        let code = self.runner.run(setup_exe, &args)?;
        info!("[Setup] setup.exe exited with code {} (0x{:X})", code, code);
        Ok(code)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::PathBuf;

    /// Pretends to run setup and returns a fixed exit code.
    pub(crate) struct FakeSetup {
        pub exit_code: i32,
        pub runs: RefCell<Vec<(PathBuf, Vec<String>)>>,
    }

    impl FakeSetup {
        pub(crate) fn exiting_with(exit_code: i32) -> Self {
            FakeSetup {
                exit_code,
                runs: RefCell::new(Vec::new()),
            }
        }
    }

    impl SetupRunner for FakeSetup {
        fn run(&self, exe: &Path, args: &[String]) -> Result<i32> {
            self.runs.borrow_mut().push((exe.to_path_buf(), args.to_vec()));
            Ok(self.exit_code)
        }
    }

    #[test]
    fn test_setup_arguments() {
        let args = setup_arguments(DynamicUpdate::Disable, Path::new("C:\\Win11UpgradeLogs"));
        assert_eq!(
            args.join(" "),
            "/Auto Upgrade /Quiet /EULA Accept /NoReboot /DynamicUpdate Disable \
             /Telemetry Disable /CopyLogs C:\\Win11UpgradeLogs"
        );

        let args = setup_arguments(DynamicUpdate::Enable, Path::new("logs"));
        let pos = args.iter().position(|a| a == "/DynamicUpdate").unwrap();
        assert_eq!(args[pos + 1], "Enable");
    }

    #[test]
    fn test_launch_creates_log_dir_and_returns_code() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs").join("nested");
        let setup = FakeSetup::exiting_with(3010);

        let code = UpgradeLauncher::new(&setup)
            .launch(Path::new("E:\\setup.exe"), DynamicUpdate::Disable, &log_dir)
            .unwrap();

        assert_eq!(code, 3010);
        assert!(log_dir.is_dir());
        let runs = setup.runs.borrow();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0, PathBuf::from("E:\\setup.exe"));
        assert_eq!(runs[0].1.last().map(String::as_str), Some(log_dir.to_str().unwrap()));
    }

    #[test]
    fn test_launch_negative_code_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        // 0xC1900101 as seen through a signed exit code
        let setup = FakeSetup::exiting_with(0xC190_0101_u32 as i32);

        let code = UpgradeLauncher::new(&setup)
            .launch(Path::new("setup.exe"), DynamicUpdate::Enable, dir.path())
            .unwrap();
        assert_eq!(code as u32, 0xC190_0101);
    }
}
