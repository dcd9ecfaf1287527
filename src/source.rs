// ============================================
// source.rs - Setup source resolution
// ============================================
//
// Turns the user's --source into the path of setup.exe.
//
// The source can be:
//   - A folder (e.g. an extracted ISO):   D:\Win11\setup.exe
//   - A disk image (.iso/.img/.vhd/.vhdx): mounted with PowerShell,
//     then setup.exe is taken from the root of the mounted volume
//
// A mounted image is wrapped in a MountGuard. The guard dismounts the
// image when it's released OR dropped, so the image never stays
// mounted after an early return.
// ============================================

use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, UpgradeError};

/// Name of the setup program at the root of Windows install media.
pub const SETUP_EXE_NAME: &str = "setup.exe";

/// File extensions Mount-DiskImage can attach.
const IMAGE_EXTENSIONS: &[&str] = &["iso", "img", "vhd", "vhdx"];

// ============================================
// MOUNTED VOLUMES
// ============================================

/// A volume that appeared after mounting a disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedVolume {
    /// None when Windows didn't assign a drive letter
    pub drive_letter: Option<char>,
    pub label: String,
}

/// Shape of one volume in `Get-Volume | ConvertTo-Json` output.
#[derive(Debug, Deserialize)]
struct RawVolume {
    #[serde(rename = "DriveLetter", default)]
    drive_letter: Option<String>,
    #[serde(rename = "FileSystemLabel", default)]
    label: Option<String>,
}

/// ConvertTo-Json emits a bare object for one volume and an array for several.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<RawVolume>),
    One(RawVolume),
}

/// Parse the JSON volume list written by the PowerShell backend.
/// Empty output means no volumes.
pub fn parse_volumes(json: &str) -> std::result::Result<Vec<MountedVolume>, serde_json::Error> {
    let json = json.trim();
    if json.is_empty() {
        return Ok(Vec::new());
    }

    let raw = match serde_json::from_str::<OneOrMany>(json)? {
        OneOrMany::Many(list) => list,
        OneOrMany::One(volume) => vec![volume],
    };

    Ok(raw
        .into_iter()
        .map(|v| MountedVolume {
            drive_letter: v
                .drive_letter
                .and_then(|d| d.trim().chars().next())
                .filter(|c| c.is_ascii_alphabetic())
                .map(|c| c.to_ascii_uppercase()),
            label: v.label.unwrap_or_default(),
        })
        .collect())
}

// ============================================
// DISK IMAGE BACKEND
// ============================================

/// Mount, inspect and dismount disk images.
pub trait DiskImageBackend {
    fn mount(&self, image: &Path) -> Result<()>;

    /// Volumes exposed by a mounted image.
    fn volumes(&self, image: &Path) -> Result<Vec<MountedVolume>>;

    /// Dismount by the same image path that was mounted.
    fn dismount(&self, image: &Path) -> Result<()>;

    /// Root directory of a drive letter ("E" -> "E:\").
    fn volume_root(&self, drive_letter: char) -> PathBuf {
        PathBuf::from(format!("{}:\\", drive_letter))
    }
}

/// The real backend: PowerShell's Storage module cmdlets.
pub struct PowerShellDiskImages;

impl PowerShellDiskImages {
    fn run(script: &str) -> std::result::Result<String, String> {
        debug!("[Source] powershell: {}", script);
        let output = Command::new("powershell")
            .args(["-NoProfile", "-NonInteractive", "-Command", script])
            .output()
            .map_err(|e| format!("failed to run PowerShell: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "PowerShell exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Quote a path as a PowerShell single-quoted string.
fn ps_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "''"))
}

impl DiskImageBackend for PowerShellDiskImages {
    fn mount(&self, image: &Path) -> Result<()> {
        let script = format!("Mount-DiskImage -ImagePath {} | Out-Null", ps_quote(image));
        Self::run(&script)
            .map(|_| ())
            .map_err(|reason| UpgradeError::MountFailed {
                path: image.to_path_buf(),
                reason,
            })
    }

    fn volumes(&self, image: &Path) -> Result<Vec<MountedVolume>> {
        // [string] turns a missing drive letter into "" instead of a char code
        let script = format!(
            "Get-DiskImage -ImagePath {} | Get-Volume | \
             Select-Object @{{Name='DriveLetter';Expression={{[string]$_.DriveLetter}}}}, FileSystemLabel | \
             ConvertTo-Json -Compress",
            ps_quote(image)
        );
        let json = Self::run(&script).map_err(|reason| UpgradeError::CommandFailed {
            program: "Get-Volume",
            reason,
        })?;
        parse_volumes(&json).map_err(|e| UpgradeError::CommandFailed {
            program: "Get-Volume",
            reason: format!("unexpected output: {}", e),
        })
    }

    fn dismount(&self, image: &Path) -> Result<()> {
        let script = format!("Dismount-DiskImage -ImagePath {} | Out-Null", ps_quote(image));
        Self::run(&script)
            .map(|_| ())
            .map_err(|reason| UpgradeError::Dismount {
                path: image.to_path_buf(),
                reason,
            })
    }
}

// ============================================
// MOUNT GUARD
// ============================================

/// A mounted disk image. Dismounted exactly once: by `release()`, or on
/// drop if it was never released.
pub struct MountGuard<'a> {
    backend: &'a dyn DiskImageBackend,
    image: Option<PathBuf>,
}

impl<'a> MountGuard<'a> {
    fn new(backend: &'a dyn DiskImageBackend, image: PathBuf) -> Self {
        MountGuard {
            backend,
            image: Some(image),
        }
    }

    /// Dismount now and report the result.
    pub fn release(mut self) -> Result<()> {
        match self.image.take() {
            Some(image) => {
                info!("[Source] Dismounting {}", image.display());
                self.backend.dismount(&image)
            }
            None => Ok(()),
        }
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if let Some(image) = self.image.take() {
            info!("[Source] Dismounting {}", image.display());
            if let Err(e) = self.backend.dismount(&image) {
                warn!("[Source] {}", e);
            }
        }
    }
}

impl fmt::Debug for MountGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountGuard").field("image", &self.image).finish()
    }
}

// ============================================
// SETUP SOURCE
// ============================================

/// Where setup.exe lives for this run.
#[derive(Debug)]
pub struct SetupSource<'a> {
    /// Folder or mounted volume root
    pub root: PathBuf,
    /// Present only when the source was a disk image
    pub mount: Option<MountGuard<'a>>,
    pub setup_exe: PathBuf,
}

impl SetupSource<'_> {
    pub fn is_mounted(&self) -> bool {
        self.mount.is_some()
    }

    /// Dismount the image (if any). Returns None for folder sources.
    pub fn release_mount(&mut self) -> Option<Result<()>> {
        self.mount.take().map(MountGuard::release)
    }
}

/// Is this file something Mount-DiskImage can attach?
pub fn is_disk_image(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Drop the `\\?\` prefix that fs::canonicalize adds on Windows.
/// setup.exe and PowerShell both prefer ordinary drive paths.
pub fn strip_verbatim_prefix(path: PathBuf) -> PathBuf {
    let text = path.to_string_lossy();
    if let Some(rest) = text.strip_prefix(r"\\?\UNC\") {
        return PathBuf::from(format!(r"\\{}", rest));
    }
    if let Some(rest) = text.strip_prefix(r"\\?\") {
        return PathBuf::from(rest);
    }
    path
}

fn canonical(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path)
        .map(strip_verbatim_prefix)
        .map_err(|_| UpgradeError::SourceNotFound(path.to_path_buf()))
}

/// Resolves a source path into a SetupSource.
pub struct SourceResolver<'a> {
    images: &'a dyn DiskImageBackend,
}

impl<'a> SourceResolver<'a> {
    pub fn new(images: &'a dyn DiskImageBackend) -> Self {
        SourceResolver { images }
    }

    /// Find setup.exe for `path`, mounting it first if it's a disk image.
    ///
    /// # Errors
    /// * `SourceNotFound` - path doesn't exist (nothing is mounted)
    /// * `UnsupportedSource` - a file that isn't a disk image
    /// * `MountFailed` / `MountResolution` - image can't be mounted or has no drive letter
    /// * `SetupExecutableNotFound` - no setup.exe at the root
    pub fn resolve(&self, path: &Path) -> Result<SetupSource<'a>> {
        if !path.exists() {
            return Err(UpgradeError::SourceNotFound(path.to_path_buf()));
        }

        let (root, mount) = if path.is_dir() {
            let root = canonical(path)?;
            info!("[Source] Using setup folder {}", root.display());
            (root, None)
        } else if is_disk_image(path) {
            let image = canonical(path)?;
            let (root, guard) = self.mount_image(image)?;
            (root, Some(guard))
        } else {
            return Err(UpgradeError::UnsupportedSource(path.to_path_buf()));
        };

        // If this fails, `mount` is dropped here and the image is dismounted
        let setup_exe = root.join(SETUP_EXE_NAME);
        if !setup_exe.is_file() {
            return Err(UpgradeError::SetupExecutableNotFound(setup_exe));
        }

        info!("[Source] Found {}", setup_exe.display());
        Ok(SetupSource {
            root,
            mount,
            setup_exe,
        })
    }

    fn mount_image(&self, image: PathBuf) -> Result<(PathBuf, MountGuard<'a>)> {
        info!("[Source] Mounting disk image {}", image.display());
        self.images.mount(&image)?;

        // From here on the guard owns the mount
        let guard = MountGuard::new(self.images, image.clone());

        let volumes = match self.images.volumes(&image) {
            Ok(volumes) => volumes,
            Err(e) => {
                warn!("[Source] {}", e);
                Vec::new()
            }
        };

        let (letter, label) = volumes
            .iter()
            .find_map(|v| v.drive_letter.map(|letter| (letter, v.label.as_str())))
            .ok_or_else(|| UpgradeError::MountResolution(image.clone()))?;

        let root = self.images.volume_root(letter);
        info!("[Source] Image mounted at {} (label: {})", root.display(), label);
        Ok((root, guard))
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Records mount/dismount calls. Drive letters map to `volume_dir`.
    #[derive(Default)]
    pub(crate) struct FakeImages {
        pub volumes: Vec<MountedVolume>,
        pub volume_dir: Option<PathBuf>,
        pub fail_mount: bool,
        pub fail_dismount: bool,
        pub calls: RefCell<Vec<String>>,
    }

    impl FakeImages {
        pub(crate) fn with_volume(letter: Option<char>, volume_dir: &Path) -> Self {
            FakeImages {
                volumes: vec![MountedVolume {
                    drive_letter: letter,
                    label: "CCCOMA_X64FRE_EN-US_DV9".to_string(),
                }],
                volume_dir: Some(volume_dir.to_path_buf()),
                ..Default::default()
            }
        }

        pub(crate) fn count(&self, prefix: &str) -> usize {
            self.calls.borrow().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    impl DiskImageBackend for FakeImages {
        fn mount(&self, image: &Path) -> Result<()> {
            self.calls.borrow_mut().push(format!("mount {}", image.display()));
            if self.fail_mount {
                return Err(UpgradeError::MountFailed {
                    path: image.to_path_buf(),
                    reason: "not a valid image".to_string(),
                });
            }
            Ok(())
        }

        fn volumes(&self, _image: &Path) -> Result<Vec<MountedVolume>> {
            Ok(self.volumes.clone())
        }

        fn dismount(&self, image: &Path) -> Result<()> {
            self.calls.borrow_mut().push(format!("dismount {}", image.display()));
            if self.fail_dismount {
                return Err(UpgradeError::Dismount {
                    path: image.to_path_buf(),
                    reason: "the device is busy".to_string(),
                });
            }
            Ok(())
        }

        fn volume_root(&self, drive_letter: char) -> PathBuf {
            match &self.volume_dir {
                Some(dir) => dir.clone(),
                None => PathBuf::from(format!("{}:\\", drive_letter)),
            }
        }
    }

    fn touch(path: &Path) {
        fs::write(path, b"MZ").unwrap();
    }

    #[test]
    fn test_parse_volumes_single_and_many() {
        let one = parse_volumes(r#"{"DriveLetter":"e","FileSystemLabel":"CCCOMA"}"#).unwrap();
        assert_eq!(
            one,
            vec![MountedVolume {
                drive_letter: Some('E'),
                label: "CCCOMA".to_string()
            }]
        );

        let many = parse_volumes(
            r#"[{"DriveLetter":"","FileSystemLabel":"EFI"},{"DriveLetter":"F","FileSystemLabel":null}]"#,
        )
        .unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many[0].drive_letter, None);
        assert_eq!(many[1].drive_letter, Some('F'));
        assert_eq!(many[1].label, "");

        assert!(parse_volumes("  \r\n").unwrap().is_empty());
        assert!(parse_volumes("Get-Volume : not found").is_err());
    }

    #[test]
    fn test_is_disk_image() {
        assert!(is_disk_image(Path::new("Win11_24H2.iso")));
        assert!(is_disk_image(Path::new("C:\\media\\disk.VHDX")));
        assert!(!is_disk_image(Path::new("setup.exe")));
        assert!(!is_disk_image(Path::new("noext")));
    }

    #[test]
    fn test_strip_verbatim_prefix() {
        assert_eq!(
            strip_verbatim_prefix(PathBuf::from(r"\\?\C:\Win11Upgrade")),
            PathBuf::from(r"C:\Win11Upgrade")
        );
        assert_eq!(
            strip_verbatim_prefix(PathBuf::from(r"\\?\UNC\server\share\win11")),
            PathBuf::from(r"\\server\share\win11")
        );
        assert_eq!(
            strip_verbatim_prefix(PathBuf::from("/tmp/win11")),
            PathBuf::from("/tmp/win11")
        );
    }

    #[test]
    fn test_resolve_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join(SETUP_EXE_NAME));
        let images = FakeImages::default();

        let source = SourceResolver::new(&images).resolve(dir.path()).unwrap();
        assert!(source.setup_exe.ends_with(SETUP_EXE_NAME));
        assert!(source.root.is_absolute());
        assert!(!source.is_mounted());
        assert!(images.calls.borrow().is_empty());
    }

    #[test]
    fn test_resolve_missing_source_never_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let images = FakeImages::default();

        let result = SourceResolver::new(&images).resolve(&dir.path().join("Win11.iso"));
        assert!(matches!(result, Err(UpgradeError::SourceNotFound(_))));
        assert!(images.calls.borrow().is_empty());
    }

    #[test]
    fn test_resolve_directory_without_setup() {
        let dir = tempfile::tempdir().unwrap();
        let images = FakeImages::default();

        let result = SourceResolver::new(&images).resolve(dir.path());
        assert!(matches!(result, Err(UpgradeError::SetupExecutableNotFound(_))));
    }

    #[test]
    fn test_resolve_unsupported_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        touch(&file);
        let images = FakeImages::default();

        let result = SourceResolver::new(&images).resolve(&file);
        assert!(matches!(result, Err(UpgradeError::UnsupportedSource(_))));
        assert!(images.calls.borrow().is_empty());
    }

    #[test]
    fn test_resolve_image_source() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("Win11.iso");
        touch(&iso);
        let volume = tempfile::tempdir().unwrap();
        touch(&volume.path().join(SETUP_EXE_NAME));
        let images = FakeImages::with_volume(Some('E'), volume.path());

        let mut source = SourceResolver::new(&images).resolve(&iso).unwrap();
        assert!(source.is_mounted());
        assert!(source.setup_exe.ends_with(SETUP_EXE_NAME));
        assert_eq!(images.count("mount"), 1);
        assert_eq!(images.count("dismount"), 0);

        assert!(matches!(source.release_mount(), Some(Ok(()))));
        assert!(source.release_mount().is_none());
        drop(source);
        assert_eq!(images.count("dismount"), 1);
    }

    #[test]
    fn test_resolve_image_without_drive_letter_dismounts() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("Win11.iso");
        touch(&iso);
        let images = FakeImages::with_volume(None, dir.path());

        let result = SourceResolver::new(&images).resolve(&iso);
        assert!(matches!(result, Err(UpgradeError::MountResolution(_))));
        assert_eq!(images.count("mount"), 1);
        assert_eq!(images.count("dismount"), 1);
    }

    #[test]
    fn test_resolve_image_without_setup_dismounts() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("Win11.iso");
        touch(&iso);
        let empty_volume = tempfile::tempdir().unwrap();
        let images = FakeImages::with_volume(Some('E'), empty_volume.path());

        let result = SourceResolver::new(&images).resolve(&iso);
        assert!(matches!(result, Err(UpgradeError::SetupExecutableNotFound(_))));
        assert_eq!(images.count("dismount"), 1);
    }

    #[test]
    fn test_failed_mount_is_not_dismounted() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("Win11.iso");
        touch(&iso);
        let images = FakeImages {
            fail_mount: true,
            ..Default::default()
        };

        let result = SourceResolver::new(&images).resolve(&iso);
        assert!(matches!(result, Err(UpgradeError::MountFailed { .. })));
        assert_eq!(images.count("dismount"), 0);
    }
}
