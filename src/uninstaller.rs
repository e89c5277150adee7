//! Uninstaller
//!
//! Reverses the installer. Every step is best-effort and tolerates the target
//! already being gone, so the operation can be re-run any number of times.

use std::fs;
use std::path::{Path, PathBuf};

use crate::installer::InstallRecord;
use crate::layout::{EntryPointDirs, InstallLayout, APP_NAME};
use crate::shortcuts::{link_path, remove_link};

#[derive(Debug, Default, Clone)]
pub struct UninstallReport {
    pub removed: Vec<PathBuf>,
    /// Failures that were suppressed (locked files and the like).
    pub warnings: Vec<String>,
}

impl UninstallReport {
    pub fn summary(&self) -> String {
        let mut out = format!("{APP_NAME} uninstalled.\n");
        for p in &self.removed {
            out.push_str(&format!("  removed: {}\n", p.display()));
        }
        for w in &self.warnings {
            out.push_str(&format!("  warning: {w}\n"));
        }
        out
    }
}

pub struct Uninstaller {
    layout: InstallLayout,
    entry_points: EntryPointDirs,
}

impl Uninstaller {
    pub fn new(layout: InstallLayout, entry_points: EntryPointDirs) -> Self {
        Self {
            layout,
            entry_points,
        }
    }

    /// Never fails; problems end up in [`UninstallReport::warnings`].
    pub fn uninstall(&self) -> UninstallReport {
        let mut report = UninstallReport::default();

        // Shortcuts recorded at install time first; the record lives inside
        // the root we are about to delete.
        let recorded = match InstallRecord::load(&self.layout.record_path()) {
            Ok(record) => record.map(|r| r.shortcuts).unwrap_or_default(),
            Err(e) => {
                report.warnings.push(format!("{e:#}"));
                Vec::new()
            }
        };

        let desktop_link = link_path(&self.entry_points.desktop, APP_NAME);
        for link in std::iter::once(desktop_link).chain(recorded) {
            match remove_link(&link) {
                Ok(true) => report.removed.push(link),
                Ok(false) => {}
                Err(e) => report.warnings.push(format!("{e:#}")),
            }
        }

        remove_dir(&self.entry_points.menu_group, &mut report);
        remove_dir(&self.layout.root, &mut report);

        for w in &report.warnings {
            log::warn!("uninstall: {}", w);
        }
        log::info!("Uninstall finished, {} item(s) removed", report.removed.len());
        report
    }
}

fn remove_dir(dir: &Path, report: &mut UninstallReport) {
    match fs::remove_dir_all(dir) {
        Ok(()) => report.removed.push(dir.to_path_buf()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => report
            .warnings
            .push(format!("remove {}: {}", dir.display(), e)),
    }
}
