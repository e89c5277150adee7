//! Tool Updater
//!
//! Refreshes vendored binaries in `<root>/tools`. Each tool is fetched into
//! `<root>/tmp`, validated, and only then renamed over the old file, so any
//! failure leaves the previous binary in place. Failures are per tool.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest, Sha256};

use crate::db::SharedDb;
use crate::error::LifecycleError;
use crate::fetch::{ArtifactFetcher, UpdateManifest};
use crate::layout::InstallLayout;
use crate::tools::{ArtifactFormat, Tool, ToolDirectory, ToolSource};
use crate::usage::ToolUsage;

/// Version recorded when the source does not announce one.
pub const UNKNOWN_VERSION: &str = "unknown";

/// A resolved plan for fetching one tool.
#[derive(Debug, Clone)]
struct UpdatePlan {
    source: ToolSource,
    version: Option<String>,
    sha256: Option<String>,
    /// Announced artifact size; a cheap truncation check without a checksum.
    size_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct UpdatedTool {
    pub tool: Tool,
    pub version: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub path: PathBuf,
}

#[derive(Debug, Default)]
pub struct UpdateReport {
    pub updated: Vec<UpdatedTool>,
    pub failed: Vec<LifecycleError>,
}

impl UpdateReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} updated, {} failed\n",
            self.updated.len(),
            self.failed.len()
        );
        for u in &self.updated {
            out.push_str(&format!(
                "  ok    {} {} ({} bytes) -> {}\n",
                u.tool,
                u.version,
                u.size_bytes,
                u.path.display()
            ));
        }
        for e in &self.failed {
            out.push_str(&format!("  error {e}\n"));
        }
        out
    }
}

pub struct ToolUpdater<'a> {
    layout: InstallLayout,
    tools: ToolDirectory,
    fetcher: &'a dyn ArtifactFetcher,
    usage: ToolUsage,
    db: Option<SharedDb>,
    manifest_url: Option<String>,
    wait: Duration,
}

impl<'a> ToolUpdater<'a> {
    pub fn new(layout: InstallLayout, fetcher: &'a dyn ArtifactFetcher, usage: ToolUsage) -> Self {
        Self {
            tools: ToolDirectory::new(layout.tools_dir()),
            layout,
            fetcher,
            usage,
            db: None,
            manifest_url: None,
            wait: Duration::from_secs(300),
        }
    }

    pub fn with_db(mut self, db: SharedDb) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_manifest_url(mut self, url: Option<String>) -> Self {
        self.manifest_url = url.filter(|u| !u.trim().is_empty());
        self
    }

    /// How long to wait for running jobs to release a tool.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Update `selected` tools (all declared tools when empty).
    pub async fn update(&self, selected: &[Tool]) -> UpdateReport {
        let selected: Vec<Tool> = if selected.is_empty() {
            Tool::ALL.to_vec()
        } else {
            selected.to_vec()
        };

        let mut report = UpdateReport::default();
        let manifest = self.load_manifest().await;
        let tmp = self.layout.tmp_dir();

        if let Err(e) = fs::create_dir_all(&tmp).and_then(|_| fs::create_dir_all(self.tools.dir()))
        {
            for tool in selected {
                report.failed.push(LifecycleError::ToolUpdateFailed {
                    tool,
                    reason: format!("create {}: {}", tmp.display(), e),
                });
            }
            return report;
        }

        // Archives shared by several tools are fetched once per run.
        let mut fetched: HashMap<String, Result<PathBuf, String>> = HashMap::new();

        for tool in selected {
            let Some(plan) = plan_for(tool, manifest.as_ref()) else {
                log::warn!("No download source for {} on this platform", tool);
                report.failed.push(LifecycleError::ToolUpdateFailed {
                    tool,
                    reason: "no download source is known for this platform".to_string(),
                });
                continue;
            };

            match self.update_one(tool, &plan, &tmp, &mut fetched).await {
                Ok(updated) => {
                    log::info!("Updated {} to {}", tool, updated.version);
                    report.updated.push(updated);
                }
                Err(e) => {
                    log::error!("{}", e);
                    report.failed.push(e);
                }
            }
        }

        if let Err(e) = fs::remove_dir_all(&tmp) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Could not remove {}: {}", tmp.display(), e);
            }
        }

        report
    }

    async fn load_manifest(&self) -> Option<UpdateManifest> {
        let url = self.manifest_url.as_deref()?;
        match self.fetcher.fetch_manifest(url).await {
            Ok(m) => Some(m),
            Err(e) => {
                log::warn!(
                    "Update manifest unavailable ({:#}); using built-in sources",
                    e
                );
                None
            }
        }
    }

    async fn update_one(
        &self,
        tool: Tool,
        plan: &UpdatePlan,
        tmp: &Path,
        fetched: &mut HashMap<String, Result<PathBuf, String>>,
    ) -> Result<UpdatedTool, LifecycleError> {
        let failed = |reason: String| LifecycleError::ToolUpdateFailed { tool, reason };

        let artifact = self
            .fetch_artifact(&plan.source.url, tmp, fetched)
            .await
            .map_err(failed)?;

        if let Some(expected) = plan.size_bytes {
            let actual = fs::metadata(&artifact)
                .map(|m| m.len())
                .map_err(|e| failed(format!("stat {}: {e}", artifact.display())))?;
            if actual != expected {
                return Err(failed(format!(
                    "size mismatch: expected {expected} bytes, got {actual}"
                )));
            }
        }

        if let Some(expected) = &plan.sha256 {
            let actual = sha256_file(&artifact).map_err(|e| failed(format!("{e:#}")))?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(failed(format!(
                    "checksum mismatch: expected {expected}, got {actual}"
                )));
            }
        }

        let staged = tmp.join(format!("{}.new", tool.binary_name()));
        let format = plan.source.format.clone();
        let (from, to) = (artifact.clone(), staged.clone());
        tokio::task::spawn_blocking(move || stage_binary(&from, &format, &to))
            .await
            .map_err(|e| failed(format!("extraction task failed: {e}")))?
            .map_err(|e| failed(format!("{e:#}")))?;

        let size_bytes = fs::metadata(&staged)
            .map(|m| m.len())
            .map_err(|e| failed(format!("stat {}: {e}", staged.display())))?;
        if size_bytes == 0 {
            return Err(failed(format!(
                "{} extracted from {} is empty",
                tool.binary_name(),
                plan.source.url
            )));
        }

        make_executable(&staged).map_err(|e| failed(format!("{e:#}")))?;
        let sha256 = sha256_file(&staged).map_err(|e| failed(format!("{e:#}")))?;

        // Jobs still running the old binary keep it until they finish.
        let _guard = self
            .usage
            .begin_update(tool, self.wait)
            .await
            .map_err(|e| match e {
                LifecycleError::ToolUpdateFailed { .. } => e,
                other => failed(other.to_string()),
            })?;

        let final_path = self.tools.path(tool);
        fs::rename(&staged, &final_path).map_err(|e| {
            failed(format!(
                "replace {}: {}",
                final_path.display(),
                e
            ))
        })?;

        let version = plan
            .version
            .clone()
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string());

        if let Some(db) = &self.db {
            let recorded = db
                .lock()
                .map_err(|_| anyhow!("state database lock poisoned"))
                .and_then(|mut db| {
                    db.record_tool(tool, &version, &sha256, size_bytes, &final_path)
                });
            if let Err(e) = recorded {
                log::warn!("Could not record {} version: {:#}", tool, e);
            }
        }

        Ok(UpdatedTool {
            tool,
            version,
            sha256,
            size_bytes,
            path: final_path,
        })
    }

    async fn fetch_artifact(
        &self,
        url: &str,
        tmp: &Path,
        fetched: &mut HashMap<String, Result<PathBuf, String>>,
    ) -> Result<PathBuf, String> {
        if let Some(cached) = fetched.get(url) {
            return cached.clone();
        }

        let dest = tmp.join(format!("download-{}", fetched.len()));
        let progress = |done: u64, total: Option<u64>| match total {
            Some(total) if total > 0 => {
                log::debug!("{}: {} / {} bytes", url, done, total)
            }
            _ => log::debug!("{}: {} bytes", url, done),
        };

        let result = match self.fetcher.fetch(url, &dest, &progress).await {
            Ok(0) => Err(format!("download from {url} was empty")),
            Ok(_) => Ok(dest),
            Err(e) => Err(format!("{e:#}")),
        };
        fetched.insert(url.to_string(), result.clone());
        result
    }
}

/// Manifest entries win over built-in sources; manifest archives are
/// recognised by extension.
fn plan_for(tool: Tool, manifest: Option<&UpdateManifest>) -> Option<UpdatePlan> {
    let entry = manifest.and_then(|m| {
        m.tools
            .iter()
            .find(|e| e.tool.parse::<Tool>().ok() == Some(tool))
    });

    if let Some(entry) = entry {
        let member = tool.binary_name().to_string();
        let url = entry.download_url.as_str();
        let format = if url.ends_with(".zip") {
            ArtifactFormat::Zip { member }
        } else if url.ends_with(".tar.xz") {
            ArtifactFormat::TarXz { member }
        } else {
            ArtifactFormat::Raw
        };
        return Some(UpdatePlan {
            source: ToolSource {
                url: entry.download_url.clone(),
                format,
            },
            version: Some(entry.version.clone()),
            sha256: entry.sha256.clone().filter(|s| !s.is_empty()),
            size_bytes: entry.size_bytes.filter(|n| *n > 0),
        });
    }

    tool.default_source().map(|source| UpdatePlan {
        source,
        version: None,
        sha256: None,
        size_bytes: None,
    })
}

/// Produce the final binary at `staged` from a downloaded artifact.
fn stage_binary(artifact: &Path, format: &ArtifactFormat, staged: &Path) -> Result<()> {
    match format {
        ArtifactFormat::Raw => {
            fs::copy(artifact, staged)
                .with_context(|| format!("copy {} to {}", artifact.display(), staged.display()))?;
        }
        ArtifactFormat::Zip { member } => extract_zip_member(artifact, member, staged)?,
        ArtifactFormat::TarXz { member } => extract_tar_xz_member(artifact, member, staged)?,
    }
    Ok(())
}

fn file_name_matches(entry_path: &str, member: &str) -> bool {
    entry_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .is_some_and(|name| name == member)
}

fn under_bin(entry_path: &str) -> bool {
    entry_path.starts_with("bin/") || entry_path.contains("/bin/")
}

fn extract_zip_member(archive: &Path, member: &str, dest: &Path) -> Result<()> {
    let file = File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file).context("read zip archive")?;

    let candidates: Vec<String> = zip
        .file_names()
        .filter(|n| !n.ends_with('/') && file_name_matches(n, member))
        .map(str::to_string)
        .collect();
    let name = candidates
        .iter()
        .find(|n| under_bin(n))
        .or_else(|| candidates.first())
        .ok_or_else(|| anyhow!("{member} not found in archive"))?;

    let mut entry = zip.by_name(name)?;
    let mut out = File::create(dest).with_context(|| format!("create {}", dest.display()))?;
    io::copy(&mut entry, &mut out).with_context(|| format!("extract {name}"))?;
    Ok(())
}

fn extract_tar_xz_member(archive: &Path, member: &str, dest: &Path) -> Result<()> {
    let file = File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let mut tar = tar::Archive::new(xz2::read::XzDecoder::new(file));

    let mut found = false;
    for entry in tar.entries().context("read tar.xz archive")? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().replace('\\', "/");
        if !file_name_matches(&path, member) {
            continue;
        }

        let mut out = File::create(dest).with_context(|| format!("create {}", dest.display()))?;
        io::copy(&mut entry, &mut out).with_context(|| format!("extract {path}"))?;
        found = true;
        if under_bin(&path) {
            break;
        }
    }

    if !found {
        bail!("{member} not found in archive");
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::db::Db;
    use crate::fetch::testing::{serve, MemoryFetcher, Reply};
    use crate::fetch::{HttpFetcher, ToolManifestEntry};

    const MANIFEST: &str = "https://updates.test/manifest.json";

    fn entry(tool: Tool, url: &str, sha256: Option<String>) -> ToolManifestEntry {
        ToolManifestEntry {
            tool: tool.as_str().to_string(),
            version: "2025.01.15".to_string(),
            download_url: url.to_string(),
            sha256,
            size_bytes: None,
        }
    }

    fn manifest(entries: Vec<ToolManifestEntry>) -> UpdateManifest {
        UpdateManifest {
            manifest_version: 1,
            updated_at: None,
            tools: entries,
        }
    }

    fn layout() -> (tempfile::TempDir, InstallLayout) {
        let tmp = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(tmp.path().join("VODDownloader"));
        fs::create_dir_all(layout.tools_dir()).unwrap();
        (tmp, layout)
    }

    fn zip_with(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        for (name, body) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[tokio::test]
    async fn failing_tool_does_not_block_the_other() {
        let (_tmp, layout) = layout();
        let tools = ToolDirectory::new(layout.tools_dir());
        fs::write(tools.path(Tool::YtDlp), b"old yt-dlp").unwrap();
        fs::write(tools.path(Tool::Deno), b"old deno").unwrap();

        let fetcher = MemoryFetcher {
            manifest: Some(manifest(vec![
                entry(Tool::YtDlp, "https://dead.test/yt-dlp", None),
                entry(Tool::Deno, "https://ok.test/deno", None),
            ])),
            ..Default::default()
        }
        .with("https://ok.test/deno", b"new deno".to_vec());

        let db: SharedDb = Arc::new(Mutex::new(Db::open_in_memory().unwrap()));
        let updater = ToolUpdater::new(layout.clone(), &fetcher, ToolUsage::new())
            .with_db(db.clone())
            .with_manifest_url(Some(MANIFEST.to_string()));
        let report = updater.update(&[Tool::YtDlp, Tool::Deno]).await;

        assert_eq!(report.updated.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            report.failed[0],
            LifecycleError::ToolUpdateFailed { tool: Tool::YtDlp, .. }
        ));
        assert_eq!(fs::read(tools.path(Tool::YtDlp)).unwrap(), b"old yt-dlp");
        assert_eq!(fs::read(tools.path(Tool::Deno)).unwrap(), b"new deno");
        assert!(report.summary().starts_with("1 updated, 1 failed"));

        let db = db.lock().unwrap();
        let rec = db.tool_record(Tool::Deno).unwrap().unwrap();
        assert_eq!(rec.version, "2025.01.15");
        assert_eq!(rec.size_bytes, 8);
        assert!(db.tool_record(Tool::YtDlp).unwrap().is_none());

        // Scratch space does not outlive the run.
        assert!(!layout.tmp_dir().exists());
    }

    #[tokio::test]
    async fn empty_download_is_rejected() {
        let (_tmp, layout) = layout();
        let tools = ToolDirectory::new(layout.tools_dir());
        fs::write(tools.path(Tool::YtDlp), b"old").unwrap();

        let fetcher = MemoryFetcher {
            manifest: Some(manifest(vec![entry(Tool::YtDlp, "https://x.test/yt-dlp", None)])),
            ..Default::default()
        }
        .with("https://x.test/yt-dlp", Vec::<u8>::new());

        let report = ToolUpdater::new(layout, &fetcher, ToolUsage::new())
            .with_manifest_url(Some(MANIFEST.to_string()))
            .update(&[Tool::YtDlp])
            .await;

        assert!(!report.is_success());
        assert!(report.failed[0].to_string().contains("empty"));
        assert_eq!(fs::read(tools.path(Tool::YtDlp)).unwrap(), b"old");
    }

    #[tokio::test]
    async fn checksum_mismatch_keeps_old_binary() {
        let (_tmp, layout) = layout();
        let tools = ToolDirectory::new(layout.tools_dir());
        fs::write(tools.path(Tool::YtDlp), b"old").unwrap();

        let fetcher = MemoryFetcher {
            manifest: Some(manifest(vec![entry(
                Tool::YtDlp,
                "https://x.test/yt-dlp",
                Some("00".repeat(32)),
            )])),
            ..Default::default()
        }
        .with("https://x.test/yt-dlp", b"tampered".to_vec());

        let report = ToolUpdater::new(layout, &fetcher, ToolUsage::new())
            .with_manifest_url(Some(MANIFEST.to_string()))
            .update(&[Tool::YtDlp])
            .await;

        assert!(report.failed[0].to_string().contains("checksum mismatch"));
        assert_eq!(fs::read(tools.path(Tool::YtDlp)).unwrap(), b"old");
    }

    #[tokio::test]
    async fn size_mismatch_keeps_old_binary() {
        let (_tmp, layout) = layout();
        let tools = ToolDirectory::new(layout.tools_dir());
        fs::write(tools.path(Tool::YtDlp), b"old").unwrap();
        fs::write(tools.path(Tool::Deno), b"old").unwrap();

        let mut short = entry(Tool::YtDlp, "https://x.test/yt-dlp", None);
        short.size_bytes = Some(4096);
        let mut exact = entry(Tool::Deno, "https://x.test/deno", None);
        exact.size_bytes = Some(8);

        let fetcher = MemoryFetcher {
            manifest: Some(manifest(vec![short, exact])),
            ..Default::default()
        }
        .with("https://x.test/yt-dlp", b"truncated".to_vec())
        .with("https://x.test/deno", b"new deno".to_vec());

        let report = ToolUpdater::new(layout, &fetcher, ToolUsage::new())
            .with_manifest_url(Some(MANIFEST.to_string()))
            .update(&[Tool::YtDlp, Tool::Deno])
            .await;

        assert_eq!(report.failed.len(), 1);
        let msg = report.failed[0].to_string();
        assert!(msg.contains("size mismatch") && msg.contains("yt-dlp"), "{msg}");
        assert_eq!(fs::read(tools.path(Tool::YtDlp)).unwrap(), b"old");
        assert_eq!(fs::read(tools.path(Tool::Deno)).unwrap(), b"new deno");
    }

    #[tokio::test]
    async fn broken_http_transfers_keep_old_binaries() {
        let base = serve(|base, path| match path {
            "/manifest.json" => Reply::Body(
                serde_json::to_vec(&manifest(vec![
                    entry(Tool::YtDlp, &format!("{base}/yt-dlp"), None),
                    entry(Tool::Deno, &format!("{base}/deno"), None),
                ]))
                .unwrap(),
            ),
            "/yt-dlp" => Reply::Truncated {
                announced: 4096,
                body: b"#!/bin/sh".to_vec(),
            },
            _ => Reply::Stall,
        })
        .await;

        let (_tmp, layout) = layout();
        let tools = ToolDirectory::new(layout.tools_dir());
        fs::write(tools.path(Tool::YtDlp), b"old yt-dlp").unwrap();
        fs::write(tools.path(Tool::Deno), b"old deno").unwrap();

        let fetcher = HttpFetcher::new(Duration::from_millis(500)).unwrap();
        let report = ToolUpdater::new(layout.clone(), &fetcher, ToolUsage::new())
            .with_manifest_url(Some(format!("{base}/manifest.json")))
            .update(&[Tool::YtDlp, Tool::Deno])
            .await;

        assert!(report.updated.is_empty(), "{}", report.summary());
        assert_eq!(report.failed.len(), 2);
        assert!(report
            .failed
            .iter()
            .all(|e| matches!(e, LifecycleError::ToolUpdateFailed { .. })));
        assert_eq!(fs::read(tools.path(Tool::YtDlp)).unwrap(), b"old yt-dlp");
        assert_eq!(fs::read(tools.path(Tool::Deno)).unwrap(), b"old deno");
        assert!(!layout.tmp_dir().exists());
    }

    #[tokio::test]
    async fn shared_archive_is_fetched_once() {
        let (_tmp, layout) = layout();
        let tools = ToolDirectory::new(layout.tools_dir());

        let url = "https://x.test/ffmpeg-release.zip";
        let ffmpeg = format!("ffmpeg-7.1/bin/{}", Tool::Ffmpeg.binary_name());
        let ffprobe = format!("ffmpeg-7.1/bin/{}", Tool::Ffprobe.binary_name());
        let doc = format!("ffmpeg-7.1/doc/{}", Tool::Ffmpeg.binary_name());
        let archive = zip_with(&[
            (doc.as_str(), &b"not me"[..]),
            (ffmpeg.as_str(), &b"ffmpeg binary"[..]),
            (ffprobe.as_str(), &b"ffprobe binary"[..]),
        ]);

        let fetcher = MemoryFetcher {
            manifest: Some(manifest(vec![
                entry(Tool::Ffmpeg, url, None),
                entry(Tool::Ffprobe, url, None),
            ])),
            ..Default::default()
        }
        .with(url, archive);

        let report = ToolUpdater::new(layout, &fetcher, ToolUsage::new())
            .with_manifest_url(Some(MANIFEST.to_string()))
            .update(&[Tool::Ffmpeg, Tool::Ffprobe])
            .await;

        assert!(report.is_success(), "{}", report.summary());
        assert_eq!(fs::read(tools.path(Tool::Ffmpeg)).unwrap(), b"ffmpeg binary");
        assert_eq!(fs::read(tools.path(Tool::Ffprobe)).unwrap(), b"ffprobe binary");
        assert_eq!(fetcher.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn archive_without_member_fails() {
        let (_tmp, layout) = layout();
        let url = "https://x.test/deno.zip";
        let fetcher = MemoryFetcher {
            manifest: Some(manifest(vec![entry(Tool::Deno, url, None)])),
            ..Default::default()
        }
        .with(url, zip_with(&[("README.md", &b"hello"[..])]));

        let report = ToolUpdater::new(layout.clone(), &fetcher, ToolUsage::new())
            .with_manifest_url(Some(MANIFEST.to_string()))
            .update(&[Tool::Deno])
            .await;

        assert!(report.failed[0].to_string().contains("not found in archive"));
        assert!(!ToolDirectory::new(layout.tools_dir()).is_present(Tool::Deno));
    }

    #[tokio::test]
    async fn tool_in_use_is_not_replaced() {
        let (_tmp, layout) = layout();
        let tools = ToolDirectory::new(layout.tools_dir());
        fs::write(tools.path(Tool::YtDlp), b"old").unwrap();

        let fetcher = MemoryFetcher {
            manifest: Some(manifest(vec![entry(Tool::YtDlp, "https://x.test/yt-dlp", None)])),
            ..Default::default()
        }
        .with("https://x.test/yt-dlp", b"new".to_vec());

        let usage = ToolUsage::new();
        let _job = usage.acquire(&[Tool::YtDlp]).await;

        let report = ToolUpdater::new(layout, &fetcher, usage.clone())
            .with_manifest_url(Some(MANIFEST.to_string()))
            .with_wait(Duration::from_millis(20))
            .update(&[Tool::YtDlp])
            .await;

        let msg = report.failed[0].to_string();
        assert!(msg.contains("in use"), "{msg}");
        assert_eq!(fs::read(tools.path(Tool::YtDlp)).unwrap(), b"old");
        assert!(!usage.is_updating(Tool::YtDlp));
    }

    #[test]
    fn manifest_overrides_builtin_source() {
        let m = manifest(vec![entry(
            Tool::Ffmpeg,
            "https://mirror.test/ffmpeg.tar.xz",
            Some(String::new()),
        )]);
        let plan = plan_for(Tool::Ffmpeg, Some(&m)).unwrap();
        assert_eq!(plan.version.as_deref(), Some("2025.01.15"));
        assert!(plan.sha256.is_none());
        assert!(plan.size_bytes.is_none());
        assert!(matches!(plan.source.format, ArtifactFormat::TarXz { .. }));

        let fallback = plan_for(Tool::YtDlp, Some(&m)).unwrap();
        assert!(fallback.version.is_none());
        assert_eq!(Some(fallback.source), Tool::YtDlp.default_source());
    }

    #[test]
    fn member_match_uses_file_name() {
        assert!(file_name_matches("ffmpeg-7.1/bin/ffmpeg", "ffmpeg"));
        assert!(!file_name_matches("ffmpeg-7.1/bin/ffmpeg.1", "ffmpeg"));
        assert!(file_name_matches("deno", "deno"));
        assert!(under_bin("x/bin/ffmpeg"));
        assert!(!under_bin("x/doc/ffmpeg"));
    }
}
