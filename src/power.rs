// ============================================
// power.rs - Sleep/hibernate timeout control
// ============================================
//
// Windows Setup can run for hours. If the machine goes to sleep
// halfway through, the upgrade stalls. So before launching setup we:
//   1. capture()     - remember the four current timeouts
//   2. disable_all() - set them all to 0 ("never")
// and after setup finishes:
//   3. restore()     - write back whatever we managed to capture
//
// The four timeouts are read and written one at a time, because
// that's how powercfg exposes them. Any single failure is reported
// and the others still get their turn.
//
// powercfg commands used:
//   powercfg /query SCHEME_CURRENT SUB_SLEEP STANDBYIDLE     (read, seconds)
//   powercfg /query SCHEME_CURRENT SUB_SLEEP HIBERNATEIDLE   (read, seconds)
//   powercfg /change standby-timeout-ac <minutes>            (write, minutes)
// ============================================

use std::fmt;
use std::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, UpgradeError};

// ============================================
// TIMEOUT SETTINGS
// ============================================

/// One of the four sleep/hibernate timeouts on the active power scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutSetting {
    StandbyAc,
    StandbyDc,
    HibernateAc,
    HibernateDc,
}

impl TimeoutSetting {
    pub const ALL: [TimeoutSetting; 4] = [
        TimeoutSetting::StandbyAc,
        TimeoutSetting::StandbyDc,
        TimeoutSetting::HibernateAc,
        TimeoutSetting::HibernateDc,
    ];

    /// Name used by `powercfg /change`
    pub fn change_flag(self) -> &'static str {
        match self {
            TimeoutSetting::StandbyAc => "standby-timeout-ac",
            TimeoutSetting::StandbyDc => "standby-timeout-dc",
            TimeoutSetting::HibernateAc => "hibernate-timeout-ac",
            TimeoutSetting::HibernateDc => "hibernate-timeout-dc",
        }
    }

    /// Setting alias under SUB_SLEEP used by `powercfg /query`
    pub fn query_alias(self) -> &'static str {
        match self {
            TimeoutSetting::StandbyAc | TimeoutSetting::StandbyDc => "STANDBYIDLE",
            TimeoutSetting::HibernateAc | TimeoutSetting::HibernateDc => "HIBERNATEIDLE",
        }
    }

    /// AC (plugged in) or DC (on battery)
    pub fn is_ac(self) -> bool {
        matches!(self, TimeoutSetting::StandbyAc | TimeoutSetting::HibernateAc)
    }
}

// ============================================
// SNAPSHOT
// ============================================

/// Timeouts captured before we changed anything, in minutes.
///
/// `None` means the value couldn't be read. Restore skips those fields
/// instead of guessing a value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PowerTimeoutSnapshot {
    pub standby_ac: Option<u32>,
    pub standby_dc: Option<u32>,
    pub hibernate_ac: Option<u32>,
    pub hibernate_dc: Option<u32>,
}

impl PowerTimeoutSnapshot {
    pub fn get(&self, setting: TimeoutSetting) -> Option<u32> {
        match setting {
            TimeoutSetting::StandbyAc => self.standby_ac,
            TimeoutSetting::StandbyDc => self.standby_dc,
            TimeoutSetting::HibernateAc => self.hibernate_ac,
            TimeoutSetting::HibernateDc => self.hibernate_dc,
        }
    }

    fn slot(&mut self, setting: TimeoutSetting) -> &mut Option<u32> {
        match setting {
            TimeoutSetting::StandbyAc => &mut self.standby_ac,
            TimeoutSetting::StandbyDc => &mut self.standby_dc,
            TimeoutSetting::HibernateAc => &mut self.hibernate_ac,
            TimeoutSetting::HibernateDc => &mut self.hibernate_dc,
        }
    }

    /// True when nothing could be read at all.
    pub fn is_empty(&self) -> bool {
        TimeoutSetting::ALL.iter().all(|s| self.get(*s).is_none())
    }

    /// Settings that failed to read.
    pub fn missing(&self) -> Vec<TimeoutSetting> {
        TimeoutSetting::ALL
            .into_iter()
            .filter(|s| self.get(*s).is_none())
            .collect()
    }
}

impl fmt::Display for PowerTimeoutSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<u32>| match v {
            Some(minutes) => format!("{} min", minutes),
            None => "-".to_string(),
        };
        write!(
            f,
            "standby AC={}, DC={}; hibernate AC={}, DC={}",
            show(self.standby_ac),
            show(self.standby_dc),
            show(self.hibernate_ac),
            show(self.hibernate_dc)
        )
    }
}

// ============================================
// BACKEND
// ============================================

/// Read/write access to the active power scheme's timeouts.
pub trait PowerBackend {
    /// Current value in minutes.
    fn query(&self, setting: TimeoutSetting) -> Result<u32>;

    /// Set a timeout in minutes (0 = never).
    fn set(&self, setting: TimeoutSetting, minutes: u32) -> Result<()>;
}

/// The real backend: shells out to powercfg.exe.
pub struct Powercfg;

impl PowerBackend for Powercfg {
    fn query(&self, setting: TimeoutSetting) -> Result<u32> {
        let output = Command::new("powercfg")
            .args(["/query", "SCHEME_CURRENT", "SUB_SLEEP", setting.query_alias()])
            .output()
            .map_err(|e| UpgradeError::PowerQuery {
                setting: setting.change_flag(),
                reason: format!("failed to run powercfg: {}", e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UpgradeError::PowerQuery {
                setting: setting.change_flag(),
                reason: format!(
                    "powercfg exited with code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let seconds = parse_setting_index(&stdout, setting.is_ac()).ok_or_else(|| {
            UpgradeError::PowerQuery {
                setting: setting.change_flag(),
                reason: "no power setting index found in powercfg output".to_string(),
            }
        })?;

        Ok(seconds_to_minutes(seconds))
    }

    fn set(&self, setting: TimeoutSetting, minutes: u32) -> Result<()> {
        let output = Command::new("powercfg")
            .args(["/change", setting.change_flag(), &minutes.to_string()])
            .output()
            .map_err(|e| UpgradeError::PowerChange {
                setting: setting.change_flag(),
                reason: format!("failed to run powercfg: {}", e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(UpgradeError::PowerChange {
                setting: setting.change_flag(),
                reason: format!(
                    "powercfg exited with code {}: {}{}",
                    output.status.code().unwrap_or(-1),
                    stdout.trim(),
                    stderr.trim()
                ),
            });
        }
        Ok(())
    }
}

/// Pull the AC or DC index out of `powercfg /query` output.
///
/// The labels are translated on non-English Windows, so only the layout
/// is used: every value line is `<label>: 0x<hex>`, and a single-setting
/// query ends with the AC index followed by the DC index:
///   `    Current AC Power Setting Index: 0x00000708`
///   `    Current DC Power Setting Index: 0x00000384`
///
/// Returns the value in seconds, or None if fewer than two hex values
/// are present.
pub fn parse_setting_index(output: &str, ac: bool) -> Option<u32> {
    let values: Vec<u32> = output.lines().filter_map(hex_value).collect();
    if values.len() < 2 {
        return None;
    }

    let dc = values[values.len() - 1];
    let ac_value = values[values.len() - 2];
    Some(if ac { ac_value } else { dc })
}

/// Value of a `<label>: 0x<hex>` line.
fn hex_value(line: &str) -> Option<u32> {
    let (_, value) = line.trim().rsplit_once(':')?;
    let value = value.trim();
    let hex = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))?;
    u32::from_str_radix(hex, 16).ok()
}

/// powercfg /query reports seconds, /change takes minutes.
/// Rounds up so a short nonzero timeout never turns into 0 ("never").
pub fn seconds_to_minutes(seconds: u32) -> u32 {
    seconds.div_ceil(60)
}

// ============================================
// CONTROLLER
// ============================================

/// Capture / disable / restore on top of a backend.
pub struct PowerController<'a> {
    backend: &'a dyn PowerBackend,
}

impl<'a> PowerController<'a> {
    pub fn new(backend: &'a dyn PowerBackend) -> Self {
        PowerController { backend }
    }

    /// Read all four timeouts. Never fails: a field that can't be read
    /// is left as None.
    pub fn capture(&self) -> PowerTimeoutSnapshot {
        let mut snapshot = PowerTimeoutSnapshot::default();
        for setting in TimeoutSetting::ALL {
            match self.backend.query(setting) {
                Ok(minutes) => {
                    debug!("[Power] {} = {} min", setting.change_flag(), minutes);
                    *snapshot.slot(setting) = Some(minutes);
                }
                Err(e) => {
                    debug!("[Power] Could not read {}: {}", setting.change_flag(), e);
                }
            }
        }
        info!("[Power] Captured timeouts: {}", snapshot);
        snapshot
    }

    /// Set every timeout to 0 (never sleep, never hibernate).
    /// Returns the settings that couldn't be changed.
    pub fn disable_all(&self) -> Vec<UpgradeError> {
        let mut failures = Vec::new();
        for setting in TimeoutSetting::ALL {
            if let Err(e) = self.backend.set(setting, 0) {
                failures.push(e);
            }
        }
        if failures.is_empty() {
            info!("[Power] Sleep and hibernate disabled");
        }
        failures
    }

    /// Write back every field that was captured. Fields that were None at
    /// capture time are not touched.
    pub fn restore(&self, snapshot: &PowerTimeoutSnapshot) -> Vec<UpgradeError> {
        let mut failures = Vec::new();
        for setting in TimeoutSetting::ALL {
            let Some(minutes) = snapshot.get(setting) else {
                warn!(
                    "[Power] {} was not captured, leaving it unchanged",
                    setting.change_flag()
                );
                continue;
            };
            match self.backend.set(setting, minutes) {
                Ok(()) => debug!("[Power] Restored {} = {} min", setting.change_flag(), minutes),
                Err(e) => failures.push(e),
            }
        }
        failures
    }
}

// ============================================
// TESTS
// ============================================
