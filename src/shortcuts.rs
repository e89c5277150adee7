//! OS entry points (desktop link + program-menu group link).
//!
//! The installer only talks to [`ShortcutProvider`]; the platform
//! implementation hands the actual work to the host shell integration:
//! the WScript.Shell automation object on Windows, freedesktop `.desktop`
//! entries on Linux, and symbolic links on macOS.

use std::fs;
use std::path::{Path, PathBuf};

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Desktop,
    MenuGroup,
}

/// One link the installer creates and the uninstaller removes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortcutEntry {
    /// Display name; also the link's file stem.
    pub name: String,
    pub target: PathBuf,
    pub working_dir: PathBuf,
    pub icon: PathBuf,
    pub placement: Placement,
    /// Directory the link is placed in.
    pub location: PathBuf,
}

impl ShortcutEntry {
    pub fn link_path(&self) -> PathBuf {
        link_path(&self.location, &self.name)
    }
}

/// Platform-specific file name of a link called `name`.
pub fn link_file_name(name: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{name}.lnk")
    } else if cfg!(target_os = "macos") {
        name.to_string()
    } else {
        format!("{name}.desktop")
    }
}

pub fn link_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(link_file_name(name))
}

/// Capability to create an OS shortcut. Returns the path of the created link.
pub trait ShortcutProvider: Send + Sync {
    fn create_shortcut(&self, entry: &ShortcutEntry) -> Result<PathBuf>;
}

/// Shortcut creation through the host operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformShortcuts;

impl ShortcutProvider for PlatformShortcuts {
    fn create_shortcut(&self, entry: &ShortcutEntry) -> Result<PathBuf> {
        fs::create_dir_all(&entry.location)
            .with_context(|| format!("create shortcut dir: {}", entry.location.display()))?;
        let link = entry.link_path();
        create_platform_link(entry, &link)?;
        log::info!("Created {:?} shortcut at {}", entry.placement, link.display());
        Ok(link)
    }
}

#[cfg(target_os = "windows")]
fn create_platform_link(entry: &ShortcutEntry, link: &Path) -> Result<()> {
    use std::process::{Command, Stdio};

    let script = wscript_shortcut_script(entry, link);
    let output = Command::new("powershell.exe")
        .args(["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-Command"])
        .arg(&script)
        .stdin(Stdio::null())
        .creation_flags(CREATE_NO_WINDOW)
        .output()
        .context("failed to start powershell.exe")?;

    if !output.status.success() {
        return Err(anyhow!(
            "powershell exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn create_platform_link(entry: &ShortcutEntry, link: &Path) -> Result<()> {
    // Symlinks carry neither a working directory nor an icon; the app falls
    // back to its known install root for both.
    if link.symlink_metadata().is_ok() {
        fs::remove_file(link).with_context(|| format!("replace link: {}", link.display()))?;
    }
    std::os::unix::fs::symlink(&entry.target, link)
        .with_context(|| format!("symlink {} -> {}", link.display(), entry.target.display()))
}

#[cfg(all(unix, not(target_os = "macos")))]
fn create_platform_link(entry: &ShortcutEntry, link: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::write(link, desktop_entry(entry))
        .with_context(|| format!("write desktop entry: {}", link.display()))?;
    // Desktop environments only launch trusted (executable) entries.
    let mut perms = fs::metadata(link)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(link, perms)?;
    Ok(())
}

/// PowerShell snippet driving the WScript.Shell automation object.
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn wscript_shortcut_script(entry: &ShortcutEntry, link: &Path) -> String {
    format!(
        "$ws = New-Object -ComObject WScript.Shell; \
         $s = $ws.CreateShortcut({link}); \
         $s.TargetPath = {target}; \
         $s.WorkingDirectory = {wd}; \
         $s.IconLocation = {icon}; \
         $s.Save()",
        link = ps_quote(&link.to_string_lossy()),
        target = ps_quote(&entry.target.to_string_lossy()),
        wd = ps_quote(&entry.working_dir.to_string_lossy()),
        icon = ps_quote(&format!("{},0", entry.icon.to_string_lossy())),
    )
}

/// Single-quoted PowerShell literal (quotes are escaped by doubling).
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[cfg_attr(not(all(unix, not(target_os = "macos"))), allow(dead_code))]
fn desktop_entry(entry: &ShortcutEntry) -> String {
    format!(
        "[Desktop Entry]\nType=Application\nName={name}\nExec=\"{exec}\"\nPath={wd}\nIcon={icon}\nTerminal=true\n",
        name = entry.name,
        exec = entry.target.display(),
        wd = entry.working_dir.display(),
        icon = entry.icon.display(),
    )
}

/// Remove a link file if present. Absence is not an error.
pub fn remove_link(link: &Path) -> Result<bool> {
    match fs::remove_file(link) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(anyhow!("remove {}: {}", link.display(), e)),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Writes a plain marker file where the link would go and records calls.
    #[derive(Default)]
    pub struct FileShortcuts {
        pub created: Mutex<Vec<ShortcutEntry>>,
    }

    impl ShortcutProvider for FileShortcuts {
        fn create_shortcut(&self, entry: &ShortcutEntry) -> Result<PathBuf> {
            fs::create_dir_all(&entry.location)?;
            let link = entry.link_path();
            fs::write(&link, entry.target.to_string_lossy().as_bytes())?;
            self.created.lock().unwrap().push(entry.clone());
            Ok(link)
        }
    }

    /// Refuses every shortcut, like a locked-down shell.
    pub struct FailingShortcuts;

    impl ShortcutProvider for FailingShortcuts {
        fn create_shortcut(&self, _entry: &ShortcutEntry) -> Result<PathBuf> {
            Err(anyhow!("shell integration unavailable"))
        }
    }
}
