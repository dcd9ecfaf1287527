// ============================================
// Win11 Upgrade Runner - build.rs
// ============================================
// This file runs BEFORE the main program is compiled.
// It embeds a Windows application manifest into the EXE so that
// launching it always triggers a UAC prompt (powercfg /change and
// Mount-DiskImage both need an elevated token).
//
// You don't need to modify this file unless you change the
// requested execution level.
// ============================================

#[cfg(target_os = "windows")]
const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<assembly xmlns="urn:schemas-microsoft-com:asm.v1" manifestVersion="1.0">
  <trustInfo xmlns="urn:schemas-microsoft-com:asm.v3">
    <security>
      <requestedPrivileges>
        <requestedExecutionLevel level="requireAdministrator" uiAccess="false"/>
      </requestedPrivileges>
    </security>
  </trustInfo>
</assembly>
"#;

fn main() {
    // Only runs on Windows targets (skipped on other platforms)
    #[cfg(target_os = "windows")]
    {
        let mut res = winres::WindowsResource::new();
        res.set_manifest(MANIFEST);
        if let Err(e) = res.compile() {
            eprintln!("Warning: Failed to embed Windows manifest: {}", e);
            // Don't fail the build; main.rs still checks elevation at runtime
        }
    }
}
