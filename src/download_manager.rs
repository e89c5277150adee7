//! Download Manager
//!
//! Turns a list of URLs into per-item jobs, runs them on a bounded worker
//! pool with yt-dlp, tracks progress, and classifies failures so one broken
//! item never stops the rest.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::db::{Db, JobStatus, SharedDb};
use crate::error::LifecycleError;
use crate::events::{helpers::action, Action, ActionKind, AppEvent, ErrorCode, Progress};
use crate::naming::{self, OutputReservations};
use crate::settings::{parse_after_date, AudioFormat, UserSettings};
use crate::tools::{ResolvedTools, Tool, ToolDirectory};
use crate::usage::ToolUsage;
use crate::ytdlp::{
    self, ItemMetadata, Probe, RunOptions, YtDlpConfig, YtDlpError, YtDlpErrorKind, YtDlpRunner,
};

/// yt-dlp download archive, kept in the output root.
pub const ARCHIVE_FILE_NAME: &str = ".ytdlp_archive.txt";

/// Machine-readable progress line requested from yt-dlp.
const PROGRESS_TEMPLATE: &str = "download:[vod] %(progress._percent_str)s %(progress._speed_str)s %(progress._eta_str)s %(progress._total_bytes_str)s";

const MAX_STDERR_LINES: usize = 2_000;

/// Error code, user message and suggested actions for a failed job.
pub type Classified = (ErrorCode, String, Vec<Action>);

/// Tools a job runs, derived from the settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPlan {
    pub required: Vec<Tool>,
    pub optional: Vec<Tool>,
}

impl ToolPlan {
    pub fn for_settings(settings: &UserSettings) -> Self {
        let d = &settings.download;
        let mut required = vec![Tool::YtDlp];
        let mut optional = Vec::new();

        // mp3 is produced by ffmpeg; everything else only benefits from it.
        if d.audio_only && d.audio_format == AudioFormat::Mp3 {
            required.push(Tool::Ffmpeg);
        } else {
            optional.push(Tool::Ffmpeg);
        }
        optional.push(Tool::Ffprobe);
        optional.push(Tool::Deno);

        Self { required, optional }
    }

    /// Everything a job leases for its whole run.
    pub fn all(&self) -> Vec<Tool> {
        self.required
            .iter()
            .chain(self.optional.iter())
            .copied()
            .collect()
    }
}

/// Resolve the plan against the tool directory.
///
/// A missing required tool blocks the run; missing optional tools come back
/// as warning messages.
pub fn preflight(
    tools: &ToolDirectory,
    plan: &ToolPlan,
) -> Result<(ResolvedTools, Vec<String>), LifecycleError> {
    let resolved = tools.resolve_set(&plan.required, &plan.optional)?;
    let warnings = plan
        .optional
        .iter()
        .filter(|t| resolved.get(**t).is_none())
        .map(|t| missing_tool_warning(*t))
        .collect();
    Ok((resolved, warnings))
}

fn missing_tool_warning(tool: Tool) -> String {
    let hint = match tool {
        Tool::Deno => "some YouTube formats may be missing",
        Tool::Ffmpeg => "merging and conversions may fail",
        Tool::Ffprobe => "post-processing may be limited",
        _ => "continuing without it",
    };
    format!("{tool} not found: {hint}. Run `vod-downloader update-tools {tool}` to fetch it.")
}

/// True when the item was uploaded before the `after` cutoff. Both are `YYYYMMDD`.
/// Items without an upload date are never filtered.
pub fn too_old(upload_date: Option<&str>, after: Option<&str>) -> bool {
    matches!((upload_date, after), (Some(date), Some(after)) if date < after)
}

/// What a finished yt-dlp run left in the item folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputCheck {
    Completed(Vec<PathBuf>),
    DryRun,
    /// yt-dlp skipped the item because the archive already lists it.
    Archived,
    Missing,
}

pub fn check_outputs(folder: &Path, item_id: &str, run: &RunOptions, archived: bool) -> OutputCheck {
    if run.dry_run {
        return OutputCheck::DryRun;
    }
    if naming::media_outputs(folder, item_id).is_empty() {
        return if archived {
            OutputCheck::Archived
        } else {
            OutputCheck::Missing
        };
    }
    OutputCheck::Completed(naming::item_outputs(folder, item_id))
}

/// Totals for one `download` invocation.
#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: Vec<LifecycleError>,
}

impl DownloadSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} completed, {} skipped, {} failed\n",
            self.completed,
            self.skipped,
            self.failed.len()
        );
        for err in &self.failed {
            out.push_str(&format!("  FAIL  {err}\n"));
        }
        out
    }
}

#[derive(Debug)]
enum ItemOutcome {
    Completed,
    Skipped,
    Failed(LifecycleError),
}

/// One item waiting for a worker. `meta` is set when the probe already
/// returned full metadata.
#[derive(Debug, Clone)]
struct QueuedItem {
    url: String,
    meta: Option<ItemMetadata>,
}

/// Download Manager handles expansion, scheduling and execution of downloads.
#[derive(Clone)]
pub struct DownloadManager {
    settings: Arc<UserSettings>,
    out_root: PathBuf,
    tools: ToolDirectory,
    usage: ToolUsage,
    db: SharedDb,
    reservations: Arc<OutputReservations>,
    event_tx: mpsc::Sender<AppEvent>,
}

impl DownloadManager {
    pub fn new(
        settings: UserSettings,
        out_root: PathBuf,
        tools: ToolDirectory,
        usage: ToolUsage,
        db: SharedDb,
        event_tx: mpsc::Sender<AppEvent>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            out_root,
            tools,
            usage,
            db,
            reservations: Arc::new(OutputReservations::new()),
            event_tx,
        }
    }

    pub fn out_root(&self) -> &Path {
        &self.out_root
    }

    /// Download every URL. Per-item failures are collected in the summary;
    /// only a failed pre-flight or an unusable output root is an `Err`.
    pub async fn run(&self, urls: &[String], run: RunOptions) -> Result<DownloadSummary> {
        let plan = ToolPlan::for_settings(&self.settings);
        let (_, warnings) = preflight(&self.tools, &plan)?;
        for message in warnings {
            log::warn!("{}", message);
            self.emit(AppEvent::ToolWarning { message }).await;
        }

        fs::create_dir_all(&self.out_root)
            .with_context(|| format!("create output folder {}", self.out_root.display()))?;

        let after = match self.settings.download.after.as_deref() {
            Some(raw) => parse_after_date(raw)?,
            None => None,
        };

        let runner = YtDlpRunner::new(YtDlpConfig {
            metadata_timeout: std::time::Duration::from_secs(
                self.settings.network.metadata_timeout_secs,
            ),
            ..YtDlpConfig::new(self.tools.path(Tool::YtDlp))
        });

        let workers = self.settings.download.concurrency.max(1) as usize;
        log::info!(
            "Downloading {} URL(s) into {} with {} worker(s){}",
            urls.len(),
            self.out_root.display(),
            workers,
            if run.dry_run { " (dry run)" } else { "" }
        );

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut set = JoinSet::new();
        let mut pending = HashMap::new();
        let mut summary = DownloadSummary::default();

        for url in urls {
            let items = match self.expand(&runner, url).await {
                Ok(items) => items,
                Err(err) => {
                    summary.failed.push(err);
                    continue;
                }
            };

            for item in items {
                let id = self.queue_job(&item.url).await;
                pending.insert(id, item.url.clone());
                let this = self.clone();
                let runner = runner.clone();
                let semaphore = semaphore.clone();
                let plan = plan.clone();
                let run = run.clone();
                let after = after.clone();

                set.spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            let failure = (
                                ErrorCode::Unknown,
                                "download pool closed before the job started".to_string(),
                                vec![action(ActionKind::Retry, "Retry")],
                            );
                            return (id, ItemOutcome::Failed(this.fail(id, &item.url, failure).await));
                        }
                    };
                    let outcome = this
                        .process_item(id, item, &runner, &plan, &run, after.as_deref())
                        .await;
                    (id, outcome)
                });
            }
        }

        self.collect(set, pending, &mut summary).await;

        if self.settings.download.open_folder_after && !run.dry_run && summary.completed > 0 {
            if let Err(e) = open::that(&self.out_root) {
                log::warn!("Could not open {}: {}", self.out_root.display(), e);
            }
        }

        Ok(summary)
    }

    /// Tally finished jobs. A job whose task panicked or was cancelled never
    /// reports back; it is failed here so it still shows up in the totals.
    async fn collect(
        &self,
        mut set: JoinSet<(Uuid, ItemOutcome)>,
        mut pending: HashMap<Uuid, String>,
        summary: &mut DownloadSummary,
    ) {
        while let Some(joined) = set.join_next().await {
            let (id, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    log::error!("Download task aborted: {}", e);
                    continue;
                }
            };
            pending.remove(&id);
            match outcome {
                ItemOutcome::Completed => summary.completed += 1,
                ItemOutcome::Skipped => summary.skipped += 1,
                ItemOutcome::Failed(err) => summary.failed.push(err),
            }
        }

        for (id, url) in pending {
            let failure = (
                ErrorCode::Unknown,
                "the download task stopped unexpectedly".to_string(),
                vec![
                    action(ActionKind::Retry, "Retry"),
                    action(ActionKind::OpenLogs, "Re-run with RUST_LOG=debug for details"),
                ],
            );
            summary.failed.push(self.fail(id, &url, failure).await);
        }
    }

    /// Probe a URL and return the items it stands for.
    async fn expand(
        &self,
        runner: &YtDlpRunner,
        url: &str,
    ) -> Result<Vec<QueuedItem>, LifecycleError> {
        let probe = {
            let _lease = self.usage.acquire(&[Tool::YtDlp]).await;
            runner.probe(url).await
        };

        match probe {
            Ok(Probe::Item(meta)) => Ok(vec![QueuedItem {
                url: url.to_string(),
                meta: Some(meta),
            }]),
            Ok(Probe::Playlist { title, entries }) => {
                log::info!(
                    "Playlist {} ({}) has {} entries",
                    url,
                    title.as_deref().unwrap_or("untitled"),
                    entries.len()
                );
                self.emit(AppEvent::PlaylistExpanded {
                    url: url.to_string(),
                    count: entries.len(),
                })
                .await;
                Ok(entries
                    .into_iter()
                    .map(|e| QueuedItem {
                        url: e.url,
                        meta: None,
                    })
                    .collect())
            }
            Err(err) => {
                let id = self.queue_job(url).await;
                Err(self.fail(id, url, classify_failure(&err)).await)
            }
        }
    }

    async fn process_item(
        &self,
        id: Uuid,
        item: QueuedItem,
        runner: &YtDlpRunner,
        plan: &ToolPlan,
        run: &RunOptions,
        after: Option<&str>,
    ) -> ItemOutcome {
        // Held until the item is finished so the updater cannot swap binaries mid-job.
        let _lease = self.usage.acquire(&plan.all()).await;

        let resolved = match self.tools.resolve_set(&plan.required, &plan.optional) {
            Ok(r) => r,
            Err(e) => {
                let failure = (
                    ErrorCode::ToolMissing,
                    e.to_string(),
                    vec![action(
                        ActionKind::UpdateYtDlp,
                        "Run `vod-downloader update-tools`",
                    )],
                );
                return ItemOutcome::Failed(self.fail(id, &item.url, failure).await);
            }
        };

        self.record("mark job running", |db| {
            db.set_job_status(id, JobStatus::Running)
        });

        let meta = match item.meta {
            Some(meta) => meta,
            None => match runner.fetch_metadata(&item.url).await {
                Ok(meta) => meta,
                Err(err) => {
                    return ItemOutcome::Failed(
                        self.fail(id, &item.url, classify_failure(&err)).await,
                    )
                }
            },
        };

        let title = meta.title.clone().unwrap_or_else(|| meta.id.clone());
        self.record("store item metadata", |db| {
            db.set_job_item(id, Some(&meta.id), Some(&title), None)
        });
        self.emit(AppEvent::MetadataReady {
            id,
            item_id: meta.id.clone(),
            title: title.clone(),
        })
        .await;

        if too_old(meta.upload_date.as_deref(), after) {
            let reason = format!(
                "{} uploaded {} is older than {}",
                meta.id,
                meta.upload_date.as_deref().unwrap_or("NA"),
                after.unwrap_or("")
            );
            return self.skip(id, reason).await;
        }

        let base = naming::item_folder_name(
            meta.upload_date.as_deref(),
            &title,
            self.settings.download.title_max_bytes,
        );
        let folder = match self.reservations.reserve(&self.out_root, &base, &meta.id) {
            Ok(folder) => folder,
            Err(e) => {
                let failure = (
                    ErrorCode::Unknown,
                    format!("{e:#}"),
                    vec![action(ActionKind::OpenLogs, "Check the output folder permissions")],
                );
                return ItemOutcome::Failed(self.fail(id, &item.url, failure).await);
            }
        };

        let folder_str = folder.to_string_lossy().into_owned();
        self.record("store output folder", |db| {
            db.set_job_item(id, None, None, Some(&folder_str))
        });
        self.emit(AppEvent::JobStarted {
            id,
            folder: folder.clone(),
        })
        .await;

        let archive = self.out_root.join(ARCHIVE_FILE_NAME);
        let mut args = progress_args();
        args.extend(ytdlp::build_download_args(
            &self.settings,
            &resolved,
            &folder,
            &archive,
            run,
            &meta.url,
        ));

        let outcome =
            match execute_download(id, runner.yt_dlp_path(), &args, &self.event_tx).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.reservations.release_empty(&folder);
                    let failure = (
                        ErrorCode::ToolMissing,
                        format!("{e:#}"),
                        vec![action(
                            ActionKind::UpdateYtDlp,
                            "Run `vod-downloader update-tools yt-dlp`",
                        )],
                    );
                    return ItemOutcome::Failed(self.fail(id, &item.url, failure).await);
                }
            };

        if !outcome.success {
            log::warn!(
                "yt-dlp exited with {:?} for {}",
                outcome.exit_code,
                meta.url
            );
            // Partial files stay for the next attempt; an empty folder goes.
            self.reservations.release_empty(&folder);
            let failure = classify_error(&outcome.stderr_lines.join("\n"));
            return ItemOutcome::Failed(self.fail(id, &item.url, failure).await);
        }

        match naming::normalize_subtitle_files(&folder) {
            Ok(renamed) if !renamed.is_empty() => {
                log::debug!("Renamed {} subtitle file(s) in {}", renamed.len(), folder_str)
            }
            Ok(_) => {}
            Err(e) => log::warn!("Subtitle rename failed in {}: {:#}", folder_str, e),
        }

        match check_outputs(&folder, &meta.id, run, outcome.archived) {
            OutputCheck::Completed(files) => {
                self.record("mark job done", |db| db.set_job_status(id, JobStatus::Done));
                log::info!("Finished {} -> {}", meta.id, folder_str);
                self.emit(AppEvent::JobCompleted { id, folder, files }).await;
                ItemOutcome::Completed
            }
            OutputCheck::DryRun => {
                self.reservations.release_empty(&folder);
                self.record("mark job done", |db| db.set_job_status(id, JobStatus::Done));
                self.emit(AppEvent::JobCompleted {
                    id,
                    folder,
                    files: Vec::new(),
                })
                .await;
                ItemOutcome::Completed
            }
            OutputCheck::Archived => {
                self.reservations.release_empty(&folder);
                self.skip(id, format!("{} is already in the download archive", meta.id))
                    .await
            }
            OutputCheck::Missing => {
                self.reservations.release_empty(&folder);
                let failure = (
                    ErrorCode::OutputMissing,
                    format!(
                        "yt-dlp finished but no media file for {} was found in {}",
                        meta.id, folder_str
                    ),
                    vec![
                        action(ActionKind::Retry, "Retry"),
                        action(ActionKind::OpenLogs, "Re-run with RUST_LOG=debug for details"),
                    ],
                );
                ItemOutcome::Failed(self.fail(id, &item.url, failure).await)
            }
        }
    }

    async fn queue_job(&self, url: &str) -> Uuid {
        let inserted = {
            let mut db = self.lock_db();
            db.insert_job(url)
        };
        let id = match inserted {
            Ok(id) => id,
            Err(e) => {
                log::error!("Failed to record job for {}: {:#}", url, e);
                Uuid::new_v4()
            }
        };
        self.emit(AppEvent::JobQueued {
            id,
            url: url.to_string(),
        })
        .await;
        id
    }

    async fn skip(&self, id: Uuid, reason: String) -> ItemOutcome {
        log::info!("Skipping job {}: {}", id, reason);
        self.record("mark job skipped", |db| {
            db.set_job_status(id, JobStatus::Skipped)
        });
        self.emit(AppEvent::JobSkipped { id, reason }).await;
        ItemOutcome::Skipped
    }

    async fn fail(&self, id: Uuid, url: &str, failure: Classified) -> LifecycleError {
        let (code, message, actions) = failure;
        log::error!("Job {} failed for {}: [{}] {}", id, url, code, message);
        self.record("store job error", |db| {
            db.set_job_error(id, code.as_str(), &message)
        });
        self.emit(AppEvent::JobFailed {
            id,
            url: url.to_string(),
            error_code: code,
            user_message: message.clone(),
            actions,
        })
        .await;
        LifecycleError::DownloadJobFailed {
            url: url.to_string(),
            code,
            message,
        }
    }

    fn lock_db(&self) -> std::sync::MutexGuard<'_, Db> {
        self.db
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a job-state write; a failed write is logged and the job goes on.
    fn record(&self, what: &str, f: impl FnOnce(&mut Db) -> Result<()>) {
        let mut db = self.lock_db();
        if let Err(e) = f(&mut db) {
            log::error!("Failed to {}: {:#}", what, e);
        }
    }

    async fn emit(&self, event: AppEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

fn progress_args() -> Vec<String> {
    vec![
        "--progress".to_string(),
        "--progress-template".to_string(),
        PROGRESS_TEMPLATE.to_string(),
    ]
}

/// Result of one yt-dlp download run.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stderr_lines: Vec<String>,
    /// yt-dlp reported the item as already recorded in the archive.
    pub archived: bool,
}

/// Recognizes the yt-dlp output lines the manager reacts to.
pub struct LineParser {
    template: Option<Regex>,
    fallback: Option<Regex>,
    percent_only: Option<Regex>,
    archived: Option<Regex>,
    size: Option<Regex>,
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LineParser {
    pub fn new() -> Self {
        Self {
            // [vod] 50.5% 1.5MiB/s 00:30 100MiB
            template: Regex::new(r"\[vod\]\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)").ok(),
            // [download]  50.5% of ~100.00MiB at 1.50MiB/s ETA 00:30
            fallback: Regex::new(
                r"\[download\]\s+(\d+\.?\d*)%\s+of\s+~?\s*(\S+)\s+at\s+(\S+)\s+ETA\s+(\S+)",
            )
            .ok(),
            percent_only: Regex::new(r"\[download\]\s+(\d+\.?\d*)%").ok(),
            archived: Regex::new(r"has already been recorded in the archive").ok(),
            size: Regex::new(r"^([\d.]+)\s*(Ki?B|Mi?B|Gi?B|B)").ok(),
        }
    }

    pub fn progress(&self, line: &str) -> Option<Progress> {
        if let Some(caps) = self.template.as_ref().and_then(|re| re.captures(line)) {
            let get = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or("");
            let percent = parse_percent(get(1));
            let bytes_total = self.bytes(get(4));
            return Some(Progress {
                percent,
                bytes_downloaded: downloaded_from(percent, bytes_total),
                bytes_total,
                speed_bps: self.speed(get(2)),
                eta_seconds: parse_eta(get(3)),
            });
        }

        if let Some(caps) = self.fallback.as_ref().and_then(|re| re.captures(line)) {
            let percent = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok());
            let bytes_total = caps.get(2).and_then(|m| self.bytes(m.as_str()));
            return Some(Progress {
                percent,
                bytes_downloaded: downloaded_from(percent, bytes_total),
                bytes_total,
                speed_bps: caps.get(3).and_then(|m| self.speed(m.as_str())),
                eta_seconds: caps.get(4).and_then(|m| parse_eta(m.as_str())),
            });
        }

        let caps = self.percent_only.as_ref()?.captures(line)?;
        let percent = caps.get(1)?.as_str().parse::<f64>().ok()?;
        Some(Progress {
            percent: Some(percent),
            ..Progress::default()
        })
    }

    /// Human name of the post-processing step a line announces.
    pub fn post_processing_step(&self, line: &str) -> Option<&'static str> {
        let line = line.trim_start();
        if line.starts_with("[Merger]") || line.contains("Merging formats") {
            Some("Merging streams")
        } else if line.starts_with("[ExtractAudio]") {
            Some("Extracting audio")
        } else if line.starts_with("[Fixup") {
            Some("Fixing container")
        } else if line.starts_with("[EmbedSubtitle]") {
            Some("Embedding subtitles")
        } else {
            None
        }
    }

    pub fn is_archive_skip(&self, line: &str) -> bool {
        self.archived.as_ref().is_some_and(|re| re.is_match(line))
    }

    /// "1.5MiB/s" or "500KiB/s"
    fn speed(&self, s: &str) -> Option<u64> {
        self.bytes(s.trim().trim_end_matches("/s"))
    }

    /// "1.5GiB", "500MiB", "~1.2GiB" or "N/A"
    fn bytes(&self, s: &str) -> Option<u64> {
        let s = s.trim().trim_start_matches('~');
        if s == "N/A" || s.is_empty() {
            return None;
        }

        let caps = self.size.as_ref()?.captures(s)?;
        let num: f64 = caps.get(1)?.as_str().parse().ok()?;
        let multiplier: f64 = match caps.get(2)?.as_str() {
            "KB" | "KiB" => 1024.0,
            "MB" | "MiB" => 1024.0 * 1024.0,
            "GB" | "GiB" => 1024.0 * 1024.0 * 1024.0,
            _ => 1.0,
        };
        Some((num * multiplier) as u64)
    }
}

fn downloaded_from(percent: Option<f64>, total: Option<u64>) -> Option<u64> {
    match (percent, total) {
        (Some(p), Some(t)) => Some((t as f64 * p / 100.0) as u64),
        _ => None,
    }
}

/// Run yt-dlp to completion, forwarding progress as events.
pub async fn execute_download(
    id: Uuid,
    yt_dlp: &Path,
    args: &[String],
    event_tx: &mpsc::Sender<AppEvent>,
) -> Result<ExecOutcome> {
    log::info!("Starting download {} with args: {:?}", id, args);

    let mut cmd = Command::new(yt_dlp);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Hide console window on Windows
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to start yt-dlp: {}", yt_dlp.display()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("failed to capture yt-dlp stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("failed to capture yt-dlp stderr"))?;

    let mut stdout_reader = BufReader::new(stdout).lines();
    let mut stderr_reader = BufReader::new(stderr).lines();

    let parser = LineParser::new();
    let mut outcome = ExecOutcome::default();
    let mut last_percent: f64 = -1.0;
    let mut last_step: Option<&'static str> = None;
    let mut stderr_open = true;

    loop {
        tokio::select! {
            line = stdout_reader.next_line() => {
                let l = match line {
                    Ok(Some(l)) => l,
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("Error reading yt-dlp stdout: {}", e);
                        break;
                    }
                };
                log::debug!("yt-dlp stdout: {}", l);

                if let Some(progress) = parser.progress(&l) {
                    // Only send if percent changed noticeably (avoid flooding)
                    let current = progress.percent.unwrap_or(0.0);
                    if (current - last_percent).abs() >= 0.5 || current >= 99.9 {
                        last_percent = current;
                        let _ = event_tx.send(AppEvent::JobProgress { id, progress }).await;
                    }
                }

                if let Some(step) = parser.post_processing_step(&l) {
                    if last_step != Some(step) {
                        last_step = Some(step);
                        log::info!("Post-processing {}: {}", id, step);
                        let _ = event_tx.send(AppEvent::JobPostProcessing {
                            id,
                            step: step.to_string(),
                        }).await;
                    }
                }

                if parser.is_archive_skip(&l) {
                    outcome.archived = true;
                }
            }
            line = stderr_reader.next_line(), if stderr_open => {
                match line {
                    Ok(Some(l)) => {
                        log::debug!("yt-dlp stderr: {}", l);
                        if outcome.stderr_lines.len() < MAX_STDERR_LINES {
                            outcome.stderr_lines.push(l);
                        }
                    }
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        log::error!("Error reading yt-dlp stderr: {}", e);
                        stderr_open = false;
                    }
                }
            }
        }
    }

    while stderr_open {
        match stderr_reader.next_line().await {
            Ok(Some(l)) if outcome.stderr_lines.len() < MAX_STDERR_LINES => {
                outcome.stderr_lines.push(l)
            }
            Ok(Some(_)) => {}
            _ => stderr_open = false,
        }
    }

    let status = child.wait().await.context("failed to wait for yt-dlp")?;
    outcome.success = status.success();
    outcome.exit_code = status.code();
    Ok(outcome)
}

fn parse_percent(s: &str) -> Option<f64> {
    let cleaned = s.trim_end_matches('%').trim();
    cleaned.parse::<f64>().ok()
}

fn parse_eta(s: &str) -> Option<u64> {
    // Format: "00:05:30" or "05:30" or "30" or "N/A"
    let s = s.trim();
    if s == "N/A" || s.is_empty() {
        return None;
    }

    let parts: Vec<&str> = s.split(':').collect();
    match parts.as_slice() {
        [secs] => secs.parse::<u64>().ok(),
        [mins, secs] => {
            let mins: u64 = mins.parse().ok()?;
            let secs: u64 = secs.parse().ok()?;
            Some(mins * 60 + secs)
        }
        [hours, mins, secs] => {
            let hours: u64 = hours.parse().ok()?;
            let mins: u64 = mins.parse().ok()?;
            let secs: u64 = secs.parse().ok()?;
            Some(hours * 3600 + mins * 60 + secs)
        }
        _ => None,
    }
}

/// Classify a failed metadata call: a missing binary or a timeout is known
/// without looking at stderr.
pub fn classify_failure(err: &anyhow::Error) -> Classified {
    match err.downcast_ref::<YtDlpError>() {
        Some(e) if e.kind == YtDlpErrorKind::NotFound => (
            ErrorCode::ToolMissing,
            e.message.clone(),
            vec![action(
                ActionKind::UpdateYtDlp,
                "Run `vod-downloader update-tools yt-dlp`",
            )],
        ),
        Some(e) if e.kind == YtDlpErrorKind::Timeout => (
            ErrorCode::Network,
            e.message.clone(),
            vec![action(ActionKind::Retry, "Retry")],
        ),
        Some(e) => classify_error(&e.stderr()),
        None => (
            ErrorCode::Unknown,
            format!("{err:#}"),
            vec![action(
                ActionKind::OpenLogs,
                "Re-run with RUST_LOG=debug for details",
            )],
        ),
    }
}

/// Classify yt-dlp errors into user-friendly categories with remediation actions.
///
/// `ERROR:` lines are matched first so warnings elsewhere in stderr do not
/// decide the category.
pub fn classify_error(stderr: &str) -> Classified {
    let error_lines: Vec<&str> = stderr
        .lines()
        .filter(|l| l.trim_start().starts_with("ERROR"))
        .collect();
    let relevant = if error_lines.is_empty() {
        stderr.to_string()
    } else {
        error_lines.join("\n")
    };
    let lower = relevant.to_lowercase();

    // Sign-in / cookies required
    if lower.contains("sign in")
        || lower.contains("login")
        || lower.contains("cookies")
        || lower.contains("age-restricted")
        || lower.contains("members-only")
    {
        return (
            ErrorCode::LoginRequired,
            "This content requires sign-in. Export cookies from a logged-in browser and retry."
                .to_string(),
            vec![action(
                ActionKind::ImportCookies,
                "Export cookies from your browser",
            )],
        );
    }

    // Bot check / CAPTCHA
    if lower.contains("not a bot") || lower.contains("captcha") || lower.contains("confirm you're not")
    {
        return (
            ErrorCode::BotCheck,
            "The site requires verification. Use cookies from a logged-in browser session."
                .to_string(),
            vec![action(
                ActionKind::ImportCookies,
                "Export cookies from your browser",
            )],
        );
    }

    // Geo-restriction
    if lower.contains("not available in your country")
        || lower.contains("geo restrict")
        || lower.contains("geo-restrict")
        || lower.contains("blocked it in your country")
    {
        return (
            ErrorCode::GeoRestricted,
            "This content is not available in your region.".to_string(),
            vec![action(
                ActionKind::ConfigureProxy,
                "Use a proxy or VPN in an allowed region",
            )],
        );
    }

    // Extractor outdated
    if lower.contains("unsupported url")
        || lower.contains("no video formats")
        || lower.contains("extractor")
        || lower.contains("unable to extract")
    {
        return (
            ErrorCode::ExtractorOutdated,
            "yt-dlp may be outdated for this site.".to_string(),
            vec![
                action(
                    ActionKind::UpdateYtDlp,
                    "Run `vod-downloader update-tools yt-dlp`",
                ),
                action(ActionKind::Retry, "Retry"),
            ],
        );
    }

    // Format unavailable
    if lower.contains("requested format") || lower.contains("format not available") {
        return (
            ErrorCode::FormatUnavailable,
            "The requested format is not available for this content.".to_string(),
            vec![action(
                ActionKind::RetryRecommended,
                "Retry without quality or bitrate limits",
            )],
        );
    }

    // ffmpeg merge / conversion
    if lower.contains("postprocessing") || lower.contains("ffmpeg") || lower.contains("ffprobe") {
        return (
            ErrorCode::PostProcessingFailed,
            "Post-processing failed. The media may need a working ffmpeg.".to_string(),
            vec![action(
                ActionKind::UpdateFfmpeg,
                "Run `vod-downloader update-tools ffmpeg`",
            )],
        );
    }

    // Network errors
    if lower.contains("network")
        || lower.contains("connection")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("http error 5")
        || lower.contains("http error 429")
    {
        return (
            ErrorCode::Network,
            "Network error occurred. Check your connection and retry.".to_string(),
            vec![action(ActionKind::Retry, "Retry")],
        );
    }

    // Default: unknown error
    let relevant = relevant.trim();
    let message = if relevant.is_empty() {
        "Download failed with unknown error.".to_string()
    } else if relevant.chars().count() > 200 {
        let head: String = relevant.chars().take(200).collect();
        format!("Download failed: {head}…")
    } else {
        format!("Download failed: {relevant}")
    };

    (
        ErrorCode::Unknown,
        message,
        vec![
            action(ActionKind::Retry, "Retry"),
            action(
                ActionKind::OpenLogs,
                "Re-run with RUST_LOG=debug for details",
            ),
        ],
    )
}
