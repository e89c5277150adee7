use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use directories::{BaseDirs, UserDirs};

/// Fixed application name. Names the install root, the menu group and the
/// desktop shortcut.
pub const APP_NAME: &str = "VODDownloader";

/// Overrides the per-user install root (useful for portable setups and tests).
pub const ROOT_ENV: &str = "VOD_DOWNLOADER_ROOT";

/// Overrides the directory the installer copies from.
pub const BUNDLE_ENV: &str = "VOD_DOWNLOADER_BUNDLE";

/// File name of the application executable inside a bundle / install root.
pub fn main_executable_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "vod-downloader.exe"
    } else {
        "vod-downloader"
    }
}

/// Resolved on-disk layout of one installation.
///
/// ```text
/// <root>/
///   vod-downloader(.exe)
///   install-record.json
///   tools/    vendored binaries
///   tmp/      scratch space for tool updates (same volume as tools/)
///   state/    sqlite database, locks/ for tool usage
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    pub root: PathBuf,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Per-user install root: `$VOD_DOWNLOADER_ROOT`, else
    /// `<local app data>/VODDownloader`.
    ///
    /// Windows: %LOCALAPPDATA%\VODDownloader
    /// macOS:   ~/Library/Application Support/VODDownloader
    /// Linux:   ~/.local/share/VODDownloader
    pub fn resolve() -> Result<Self> {
        if let Some(root) = env::var_os(ROOT_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(root));
        }
        let base = BaseDirs::new()
            .ok_or_else(|| anyhow!("failed to resolve per-user app data directory"))?;
        Ok(Self::new(base.data_local_dir().join(APP_NAME)))
    }

    pub fn executable(&self) -> PathBuf {
        self.root.join(main_executable_name())
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.root.join("tools")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    /// Per-tool lock files shared by `download` and `update-tools`.
    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir().join("locks")
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir().join("vod-downloader.sqlite3")
    }

    pub fn record_path(&self) -> PathBuf {
        self.root.join("install-record.json")
    }

    /// Create the runtime directories (state + tools). Never called by the
    /// installer, so a fresh install only contains what the bundle ships.
    pub fn ensure_runtime_dirs(&self) -> Result<()> {
        for dir in [self.state_dir(), self.tools_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("create dir: {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Where OS entry points live for the current user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPointDirs {
    pub desktop: PathBuf,
    /// The per-application group, e.g. `Start Menu\Programs\VODDownloader`.
    pub menu_group: PathBuf,
}

impl EntryPointDirs {
    pub fn resolve() -> Result<Self> {
        let base = BaseDirs::new()
            .ok_or_else(|| anyhow!("failed to resolve the user's home directory"))?;
        let desktop = UserDirs::new()
            .and_then(|u| u.desktop_dir().map(Path::to_path_buf))
            .unwrap_or_else(|| base.home_dir().join("Desktop"));

        Ok(Self {
            desktop,
            menu_group: menu_root(&base).join(APP_NAME),
        })
    }
}

#[cfg(target_os = "windows")]
fn menu_root(base: &BaseDirs) -> PathBuf {
    // %APPDATA%\Microsoft\Windows\Start Menu\Programs
    base.config_dir()
        .join("Microsoft")
        .join("Windows")
        .join("Start Menu")
        .join("Programs")
}

#[cfg(target_os = "macos")]
fn menu_root(base: &BaseDirs) -> PathBuf {
    base.home_dir().join("Applications")
}

#[cfg(all(unix, not(target_os = "macos")))]
fn menu_root(base: &BaseDirs) -> PathBuf {
    base.data_dir().join("applications")
}

/// Directory the installer copies from: `$VOD_DOWNLOADER_BUNDLE`, else the
/// directory containing the running executable.
pub fn bundle_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os(BUNDLE_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let exe = env::current_exe().context("locate running executable")?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("executable has no parent directory: {}", exe.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_hang_off_root() {
        let layout = InstallLayout::new("/home/u/.local/share/VODDownloader");
        assert_eq!(
            layout.tools_dir(),
            PathBuf::from("/home/u/.local/share/VODDownloader/tools")
        );
        assert!(layout.db_path().starts_with(layout.state_dir()));
        assert!(layout.locks_dir().starts_with(layout.state_dir()));
        assert!(layout.tmp_dir().starts_with(&layout.root));
        assert_eq!(
            layout.executable().file_name().unwrap(),
            main_executable_name()
        );
    }

    #[test]
    fn menu_group_is_named_after_app() {
        if let Ok(dirs) = EntryPointDirs::resolve() {
            assert_eq!(dirs.menu_group.file_name().unwrap(), APP_NAME);
        }
    }
}
