//! Output naming: one folder per item, media named after the item ID,
//! subtitles as `<ID>-<LANG>.<ext>` with an upper-case language code.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

const SUBTITLE_EXTS: &[&str] = &["vtt", "srt", "ass", "ttml"];

/// `<YYYY-MM-DD>+<title>`, title sanitized and cut to `max_title_bytes`.
pub fn item_folder_name(upload_date: Option<&str>, title: &str, max_title_bytes: usize) -> String {
    let date = upload_date
        .filter(|d| d.len() == 8 && d.chars().all(|c| c.is_ascii_digit()))
        .map(|d| format!("{}-{}-{}", &d[0..4], &d[4..6], &d[6..8]))
        .unwrap_or_else(|| "NA".to_string());

    let options = sanitize_filename::Options {
        truncate: false,
        windows: true,
        replacement: "_",
    };
    let clean = sanitize_filename::sanitize_with_options(title.trim(), options);
    let clean = truncate_bytes(&clean, max_title_bytes);
    // Windows drops trailing dots and spaces from directory names.
    let clean = clean.trim_end_matches(['.', ' ']);
    let clean = if clean.is_empty() { "untitled" } else { clean };

    format!("{date}+{clean}")
}

fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

pub fn video_file_name(item_id: &str, ext: &str) -> String {
    format!("{item_id}.{ext}")
}

pub fn subtitle_file_name(item_id: &str, lang: &str, ext: &str) -> String {
    format!("{item_id}-{}.{ext}", lang.to_uppercase())
}

fn is_subtitle(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SUBTITLE_EXTS.iter().any(|s| e.eq_ignore_ascii_case(s)))
}

/// Rename `<ID>-<lang>.<ext>` subtitle files in `folder` to upper-case
/// language codes. The ID may itself contain `-`; the code is the last part.
pub fn normalize_subtitle_files(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut renamed = Vec::new();
    let entries =
        fs::read_dir(folder).with_context(|| format!("read dir {}", folder.display()))?;

    for entry in entries {
        let path = entry?.path();
        if !path.is_file() || !is_subtitle(&path) {
            continue;
        }
        let (Some(stem), Some(ext)) = (
            path.file_stem().and_then(|s| s.to_str()),
            path.extension().and_then(|s| s.to_str()),
        ) else {
            continue;
        };
        let Some((base, lang)) = stem.rsplit_once('-') else {
            continue;
        };

        let target = path.with_file_name(subtitle_file_name(base, lang, ext));
        if target != path {
            fs::rename(&path, &target).with_context(|| {
                format!("rename {} to {}", path.display(), target.display())
            })?;
            renamed.push(target);
        }
    }

    renamed.sort();
    Ok(renamed)
}

/// Files in `folder` that belong to `item_id` (media, subtitles, partials excluded).
pub fn item_outputs(folder: &Path, item_id: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(folder) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(item_id) && !n.ends_with(".part") && !n.ends_with(".ytdl"))
        })
        .collect();
    files.sort();
    files
}

/// True when `folder` is empty or holds any file of `item_id`, partial
/// downloads included. Such a folder is resumed instead of sidestepped.
fn reusable_for(folder: &Path, item_id: &str) -> bool {
    let Ok(entries) = fs::read_dir(folder) else {
        return false;
    };
    let mut empty = true;
    for entry in entries.filter_map(|e| e.ok()) {
        empty = false;
        if entry.file_name().to_str().is_some_and(|n| n.starts_with(item_id)) {
            return true;
        }
    }
    empty
}

/// Media files for the item, i.e. outputs that are not subtitles.
pub fn media_outputs(folder: &Path, item_id: &str) -> Vec<PathBuf> {
    item_outputs(folder, item_id)
        .into_iter()
        .filter(|p| !is_subtitle(p))
        .collect()
}

/// Folder names claimed by jobs of this process.
///
/// A name is usable when no other job holds it and the folder is absent,
/// empty, or already holds files (finished or partial) for the same item. Collisions fall back to
/// `<name> [<ID>]`, then `<name> [<ID>] (2)`, `(3)`, ...
#[derive(Debug, Default)]
pub struct OutputReservations {
    reserved: Mutex<HashSet<PathBuf>>,
}

impl OutputReservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve and create a folder under `parent` for `item_id`.
    pub fn reserve(&self, parent: &Path, base: &str, item_id: &str) -> Result<PathBuf> {
        let mut reserved = self
            .reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut attempt = 0usize;
        let folder = loop {
            let name = match attempt {
                0 => base.to_string(),
                1 => format!("{base} [{item_id}]"),
                n => format!("{base} [{item_id}] ({n})"),
            };
            let candidate = parent.join(name);
            let usable = !reserved.contains(&candidate)
                && (!candidate.exists() || reusable_for(&candidate, item_id));
            if usable {
                break candidate;
            }
            attempt += 1;
        };

        fs::create_dir_all(&folder)
            .with_context(|| format!("create output folder {}", folder.display()))?;
        reserved.insert(folder.clone());
        log::debug!("Reserved output folder {}", folder.display());
        Ok(folder)
    }

    /// Drop the claim on `folder` and remove it if nothing was written.
    pub fn release_empty(&self, folder: &Path) {
        if fs::remove_dir(folder).is_ok() {
            log::debug!("Removed empty output folder {}", folder.display());
        }
        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(folder);
    }

    pub fn is_reserved(&self, folder: &Path) -> bool {
        self.reserved
            .lock()
            .map(|r| r.contains(folder))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn subtitle_and_video_names() {
        assert_eq!(subtitle_file_name("abc123XYZ_", "en", "vtt"), "abc123XYZ_-EN.vtt");
        assert_eq!(video_file_name("abc123XYZ_", "mp4"), "abc123XYZ_.mp4");
    }

    #[test]
    fn folder_name_has_date_and_clean_title() {
        assert_eq!(
            item_folder_name(Some("20240131"), "Live: Q&A / part 1?", 120),
            "2024-01-31+Live_ Q&A _ part 1_"
        );
        assert_eq!(item_folder_name(None, "   ", 120), "NA+untitled");
        assert_eq!(item_folder_name(Some("bad"), "x", 120), "NA+x");
    }

    #[test]
    fn folder_title_is_cut_on_char_boundary() {
        let name = item_folder_name(Some("20240101"), "ééééé", 3);
        assert_eq!(name, "2024-01-01+é");
        let name = item_folder_name(Some("20240101"), "abc.  def", 5);
        assert_eq!(name, "2024-01-01+abc");
    }

    #[test]
    fn subtitle_files_get_uppercase_codes() {
        let dir = tempfile::tempdir().unwrap();
        let id = "a-b_c-1234x";
        fs::write(dir.path().join(format!("{id}.mp4")), b"v").unwrap();
        fs::write(dir.path().join(format!("{id}-en.vtt")), b"s").unwrap();
        fs::write(dir.path().join(format!("{id}-HU.vtt")), b"s").unwrap();

        let renamed = normalize_subtitle_files(dir.path()).unwrap();
        assert_eq!(renamed, vec![dir.path().join(format!("{id}-EN.vtt"))]);
        assert!(dir.path().join(format!("{id}-HU.vtt")).exists());
        assert!(dir.path().join(format!("{id}.mp4")).exists());

        assert_eq!(media_outputs(dir.path(), id), vec![dir.path().join(format!("{id}.mp4"))]);
        assert_eq!(item_outputs(dir.path(), id).len(), 3);
    }

    #[test]
    fn colliding_titles_get_distinct_folders() {
        let dir = tempfile::tempdir().unwrap();
        let res = OutputReservations::new();
        let base = item_folder_name(Some("20240101"), "Same title", 120);

        let a = res.reserve(dir.path(), &base, "AAAAAAAAAAA").unwrap();
        let b = res.reserve(dir.path(), &base, "BBBBBBBBBBB").unwrap();
        let c = res.reserve(dir.path(), &base, "BBBBBBBBBBB").unwrap();

        assert_eq!(a, dir.path().join(&base));
        assert_eq!(b, dir.path().join(format!("{base} [BBBBBBBBBBB]")));
        assert_eq!(c, dir.path().join(format!("{base} [BBBBBBBBBBB] (2)")));
        assert!(a.is_dir() && b.is_dir() && c.is_dir());
        assert!(res.is_reserved(&b));
    }

    #[test]
    fn existing_folder_reused_only_for_same_item() {
        let dir = tempfile::tempdir().unwrap();
        let base = "2024-01-01+Title";
        let existing = dir.path().join(base);
        fs::create_dir_all(&existing).unwrap();
        fs::write(existing.join("ID1.mp4"), b"v").unwrap();

        // New process, same item: resume into the same folder.
        let res = OutputReservations::new();
        assert_eq!(res.reserve(dir.path(), base, "ID1").unwrap(), existing);

        // Different item with the same title and date.
        let res = OutputReservations::new();
        assert_eq!(
            res.reserve(dir.path(), base, "ID2").unwrap(),
            dir.path().join(format!("{base} [ID2]"))
        );
    }

    #[test]
    fn failed_attempt_is_resumed_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let base = "2024-01-01+Title";

        let first = OutputReservations::new().reserve(dir.path(), base, "ID1").unwrap();
        fs::write(first.join("ID1.f137.mp4.part"), b"p").unwrap();
        fs::write(first.join("ID1.f137.mp4.ytdl"), b"y").unwrap();

        let second = OutputReservations::new().reserve(dir.path(), base, "ID1").unwrap();
        assert_eq!(second, first);

        // Someone else's partials still push a different item aside.
        let other = OutputReservations::new().reserve(dir.path(), base, "ID2").unwrap();
        assert_eq!(other, dir.path().join(format!("{base} [ID2]")));
    }

    #[test]
    fn empty_folder_is_reused_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let base = "NA+Leftover";
        fs::create_dir_all(dir.path().join(base)).unwrap();

        let res = OutputReservations::new();
        let folder = res.reserve(dir.path(), base, "ID9").unwrap();
        assert_eq!(folder, dir.path().join(base));

        res.release_empty(&folder);
        assert!(!folder.exists());
        assert!(!res.is_reserved(&folder));

        // Folders with content survive a release.
        let kept = res.reserve(dir.path(), base, "ID9").unwrap();
        fs::write(kept.join("ID9.mp4.part"), b"p").unwrap();
        res.release_empty(&kept);
        assert!(kept.join("ID9.mp4.part").exists());
    }

    #[test]
    fn concurrent_reservations_never_share() {
        let dir = tempfile::tempdir().unwrap();
        let res = Arc::new(OutputReservations::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let res = res.clone();
                let parent = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    res.reserve(&parent, "2024-01-01+Clash", &format!("id{i}"))
                        .unwrap()
                })
            })
            .collect();
        let folders: HashSet<PathBuf> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(folders.len(), 8);
    }
}
