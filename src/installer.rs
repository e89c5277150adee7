//! Installer
//!
//! Materializes the application bundle into the per-user install root and
//! registers the desktop / program-menu entry points.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::LifecycleError;
use crate::layout::{main_executable_name, EntryPointDirs, InstallLayout, APP_NAME};
use crate::shortcuts::{Placement, ShortcutEntry, ShortcutProvider};

/// What an installation left on disk. Persisted as `install-record.json` so
/// the uninstaller can find shortcuts even if the user's desktop moved.
///
/// The content is a pure function of the inputs, so re-installing rewrites
/// an identical file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub app_name: String,
    pub root: PathBuf,
    pub tools: Vec<PathBuf>,
    pub shortcuts: Vec<PathBuf>,
}

impl InstallRecord {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(
                serde_json::from_str(&text)
                    .with_context(|| format!("parse install record: {}", path.display()))?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read install record: {}", path.display())),
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("write install record: {}", path.display()))
    }
}

/// Result of a successful (possibly partial) installation.
#[derive(Debug)]
pub struct InstallReport {
    pub root: PathBuf,
    pub files_copied: usize,
    pub shortcuts: Vec<PathBuf>,
    /// Shortcut failures. Logged, never fatal.
    pub shortcut_errors: Vec<LifecycleError>,
}

impl InstallReport {
    /// Human readable summary printed by the CLI.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{APP_NAME} installed to {}\n  files copied: {}\n",
            self.root.display(),
            self.files_copied
        );
        for link in &self.shortcuts {
            out.push_str(&format!("  shortcut: {}\n", link.display()));
        }
        for err in &self.shortcut_errors {
            out.push_str(&format!("  warning: {err}\n"));
        }
        out
    }
}

pub struct Installer<'a> {
    bundle: PathBuf,
    layout: InstallLayout,
    entry_points: EntryPointDirs,
    shortcuts: &'a dyn ShortcutProvider,
}

impl<'a> Installer<'a> {
    pub fn new(
        bundle: impl Into<PathBuf>,
        layout: InstallLayout,
        entry_points: EntryPointDirs,
        shortcuts: &'a dyn ShortcutProvider,
    ) -> Self {
        Self {
            bundle: bundle.into(),
            layout,
            entry_points,
            shortcuts,
        }
    }

    /// Fails with [`LifecycleError::MissingBundleArtifact`] before touching
    /// the filesystem when the bundle has no main executable.
    pub fn check_bundle(&self) -> Result<PathBuf, LifecycleError> {
        let exe = self.bundle.join(main_executable_name());
        if exe.is_file() {
            Ok(exe)
        } else {
            Err(LifecycleError::MissingBundleArtifact { expected: exe })
        }
    }

    pub fn install(&self) -> Result<InstallReport> {
        self.check_bundle()?;

        let root = &self.layout.root;
        fs::create_dir_all(root)
            .with_context(|| format!("create install dir: {}", root.display()))?;

        let files_copied = if same_dir(&self.bundle, root) {
            log::info!("Bundle already lives in {}, nothing to copy", root.display());
            0
        } else {
            copy_tree(&self.bundle, root, root)?
        };
        log::info!("Copied {} file(s) into {}", files_copied, root.display());

        let exe = self.layout.executable();
        let mut shortcuts = Vec::new();
        let mut shortcut_errors = Vec::new();
        for entry in self.shortcut_entries(&exe) {
            match self.shortcuts.create_shortcut(&entry) {
                Ok(link) => shortcuts.push(link),
                Err(e) => {
                    let err = LifecycleError::ShortcutCreationFailed {
                        link: entry.link_path(),
                        reason: format!("{e:#}"),
                    };
                    log::warn!("{err}");
                    shortcut_errors.push(err);
                }
            }
        }

        let record = InstallRecord {
            app_name: APP_NAME.to_string(),
            root: root.clone(),
            tools: vendored_files(&self.layout.tools_dir())?,
            shortcuts: shortcuts.clone(),
        };
        record.save(&self.layout.record_path())?;

        Ok(InstallReport {
            root: root.clone(),
            files_copied,
            shortcuts,
            shortcut_errors,
        })
    }

    fn shortcut_entries(&self, exe: &Path) -> Vec<ShortcutEntry> {
        [
            (Placement::Desktop, &self.entry_points.desktop),
            (Placement::MenuGroup, &self.entry_points.menu_group),
        ]
        .into_iter()
        .map(|(placement, location)| ShortcutEntry {
            name: APP_NAME.to_string(),
            target: exe.to_path_buf(),
            working_dir: self.layout.root.clone(),
            icon: exe.to_path_buf(),
            placement,
            location: location.clone(),
        })
        .collect()
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Recursively copy `src` into `dst`, overwriting files of the same name.
/// `skip` (the install root) is never descended into, so a root nested in
/// the bundle cannot recurse into itself.
fn copy_tree(src: &Path, dst: &Path, skip: &Path) -> Result<usize> {
    let skip = skip.canonicalize().unwrap_or_else(|_| skip.to_path_buf());
    let mut copied = 0;
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from_dir, to_dir)) = stack.pop() {
        fs::create_dir_all(&to_dir)
            .with_context(|| format!("create dir: {}", to_dir.display()))?;
        let entries = fs::read_dir(&from_dir)
            .with_context(|| format!("read bundle dir: {}", from_dir.display()))?;

        for entry in entries {
            let entry = entry?;
            let from = entry.path();
            let to = to_dir.join(entry.file_name());
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                if from.canonicalize().map(|c| c == skip).unwrap_or(false) {
                    continue;
                }
                stack.push((from, to));
            } else {
                fs::copy(&from, &to).with_context(|| {
                    format!("copy {} -> {}", from.display(), to.display())
                })?;
                copied += 1;
            }
        }
    }

    Ok(copied)
}

fn vendored_files(tools_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if let Ok(entries) = fs::read_dir(tools_dir) {
        for entry in entries {
            let path = entry?.path();
            if path.is_file() {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::shortcuts::testing::{FailingShortcuts, FileShortcuts};
    use std::collections::BTreeMap;

    pub(crate) struct Fixture {
        pub _tmp: tempfile::TempDir,
        pub bundle: PathBuf,
        pub layout: InstallLayout,
        pub entry_points: EntryPointDirs,
    }

    pub(crate) fn fixture(with_exe: bool) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = tmp.path().join("bundle");
        fs::create_dir_all(bundle.join("tools")).unwrap();
        if with_exe {
            fs::write(bundle.join(main_executable_name()), b"app").unwrap();
        }
        fs::write(bundle.join("tools").join("yt-dlp"), b"ytdlp").unwrap();
        fs::write(bundle.join("README.txt"), b"readme").unwrap();

        Fixture {
            layout: InstallLayout::new(tmp.path().join("appdata").join(APP_NAME)),
            entry_points: EntryPointDirs {
                desktop: tmp.path().join("Desktop"),
                menu_group: tmp.path().join("Programs").join(APP_NAME),
            },
            bundle,
            _tmp: tmp,
        }
    }

    /// Relative path -> contents for every file under `dir`.
    pub(crate) fn snapshot(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        let mut out = BTreeMap::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(d) = stack.pop() {
            let Ok(entries) = fs::read_dir(&d) else { continue };
            for e in entries {
                let p = e.unwrap().path();
                if p.is_dir() {
                    stack.push(p);
                } else {
                    out.insert(p.strip_prefix(dir).unwrap().to_path_buf(), fs::read(&p).unwrap());
                }
            }
        }
        out
    }

    #[test]
    fn install_copies_bundle_and_creates_both_shortcuts() {
        let fx = fixture(true);
        let links = FileShortcuts::default();
        let installer = Installer::new(&fx.bundle, fx.layout.clone(), fx.entry_points.clone(), &links);

        let report = installer.install().unwrap();

        assert_eq!(report.files_copied, 3);
        assert!(fx.layout.executable().is_file());
        assert!(fx.layout.tools_dir().join("yt-dlp").is_file());
        assert_eq!(report.shortcuts.len(), 2);
        assert!(report.shortcut_errors.is_empty());

        let created = links.created.lock().unwrap();
        assert!(created.iter().all(|e| e.working_dir == fx.layout.root));
        assert!(created.iter().all(|e| e.target == fx.layout.executable()));
        assert!(created.iter().all(|e| e.icon == fx.layout.executable()));
        assert!(created.iter().any(|e| e.location == fx.entry_points.menu_group));

        let record = InstallRecord::load(&fx.layout.record_path()).unwrap().unwrap();
        assert_eq!(record.shortcuts, report.shortcuts);
        assert_eq!(record.tools, vec![fx.layout.tools_dir().join("yt-dlp")]);
        assert!(report.summary().contains(&fx.layout.root.display().to_string()));
    }

    #[test]
    fn reinstall_is_idempotent() {
        let fx = fixture(true);
        let links = FileShortcuts::default();
        let installer = Installer::new(&fx.bundle, fx.layout.clone(), fx.entry_points.clone(), &links);

        installer.install().unwrap();
        let first = snapshot(&fx.layout.root);
        installer.install().unwrap();
        let second = snapshot(&fx.layout.root);

        assert_eq!(first, second);
    }

    #[test]
    fn missing_executable_changes_nothing() {
        let fx = fixture(false);
        let links = FileShortcuts::default();
        let installer = Installer::new(&fx.bundle, fx.layout.clone(), fx.entry_points.clone(), &links);

        let err = installer.install().unwrap_err();
        let lifecycle = err.downcast_ref::<LifecycleError>().unwrap();
        assert!(matches!(lifecycle, LifecycleError::MissingBundleArtifact { .. }));
        assert_eq!(lifecycle.exit_code(), 1);

        assert!(!fx.layout.root.exists());
        assert!(!fx.entry_points.desktop.exists());
        assert!(!fx.entry_points.menu_group.exists());
        assert!(links.created.lock().unwrap().is_empty());
    }

    #[test]
    fn shortcut_failure_is_not_fatal() {
        let fx = fixture(true);
        let installer =
            Installer::new(&fx.bundle, fx.layout.clone(), fx.entry_points.clone(), &FailingShortcuts);

        let report = installer.install().unwrap();

        assert!(fx.layout.executable().is_file());
        assert!(report.shortcuts.is_empty());
        assert_eq!(report.shortcut_errors.len(), 2);
        assert!(report.summary().contains("warning"));
    }

    #[test]
    fn install_root_inside_bundle_does_not_recurse() {
        let fx = fixture(true);
        let layout = InstallLayout::new(fx.bundle.join("nested").join(APP_NAME));
        let links = FileShortcuts::default();
        let installer = Installer::new(&fx.bundle, layout.clone(), fx.entry_points.clone(), &links);

        installer.install().unwrap();
        installer.install().unwrap();

        assert!(layout.executable().is_file());
        assert!(!layout.root.join("nested").join(APP_NAME).exists());
    }
}
