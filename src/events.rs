use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

/// A remediation the user can take, printed under a failure.
/// `kind` is stable; `label` is the human text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    ImportCookies,
    UpdateYtDlp,
    UpdateFfmpeg,
    ConfigureProxy,
    RetryRecommended,
    Retry,
    OpenLogs,
}

#[derive(Debug, Clone, Serialize)]
pub struct Action {
    pub kind: ActionKind,
    pub label: String,
}

/// Stable error codes for job failures, persisted with the job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unknown,
    InvalidUrl,
    Network,
    GeoRestricted,
    LoginRequired,
    BotCheck,
    ExtractorOutdated,
    FormatUnavailable,
    ToolMissing,
    OutputMissing,
    PostProcessingFailed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::InvalidUrl => "INVALID_URL",
            ErrorCode::Network => "NETWORK",
            ErrorCode::GeoRestricted => "GEO_RESTRICTED",
            ErrorCode::LoginRequired => "LOGIN_REQUIRED",
            ErrorCode::BotCheck => "BOT_CHECK",
            ErrorCode::ExtractorOutdated => "EXTRACTOR_OUTDATED",
            ErrorCode::FormatUnavailable => "FORMAT_UNAVAILABLE",
            ErrorCode::ToolMissing => "TOOL_MISSING",
            ErrorCode::OutputMissing => "OUTPUT_MISSING",
            ErrorCode::PostProcessingFailed => "POST_PROCESSING_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress values are best-effort; any field may be None depending on what yt-dlp reports.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Progress {
    /// 0..=100 if known.
    pub percent: Option<f64>,
    pub bytes_downloaded: Option<u64>,
    pub bytes_total: Option<u64>,
    pub speed_bps: Option<u64>,
    pub eta_seconds: Option<u64>,
}

/// Orchestrator -> front-end events, sent over an mpsc channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum AppEvent {
    JobQueued {
        id: Uuid,
        url: String,
    },
    PlaylistExpanded {
        url: String,
        count: usize,
    },
    /// A tool the job could use is missing; the job continues without it.
    ToolWarning {
        message: String,
    },
    MetadataReady {
        id: Uuid,
        item_id: String,
        title: String,
    },
    JobSkipped {
        id: Uuid,
        reason: String,
    },
    JobStarted {
        id: Uuid,
        folder: PathBuf,
    },
    JobProgress {
        id: Uuid,
        progress: Progress,
    },
    JobPostProcessing {
        id: Uuid,
        step: String,
    },
    JobCompleted {
        id: Uuid,
        folder: PathBuf,
        files: Vec<PathBuf>,
    },
    JobFailed {
        id: Uuid,
        url: String,
        error_code: ErrorCode,
        user_message: String,
        actions: Vec<Action>,
    },
}

impl AppEvent {
    /// One-line rendering for the terminal. Progress ticks are left to the
    /// caller to throttle.
    pub fn describe(&self) -> String {
        match self {
            AppEvent::JobQueued { url, .. } => format!("queued   {url}"),
            AppEvent::PlaylistExpanded { url, count } => {
                format!("playlist {url}: {count} item(s)")
            }
            AppEvent::ToolWarning { message } => format!("warning  {message}"),
            AppEvent::MetadataReady { item_id, title, .. } => {
                format!("found    [{item_id}] {title}")
            }
            AppEvent::JobSkipped { reason, .. } => format!("skipped  {reason}"),
            AppEvent::JobStarted { folder, .. } => format!("started  -> {}", folder.display()),
            AppEvent::JobProgress { progress, .. } => {
                let mut line = match progress.percent {
                    Some(p) => format!("progress {p:5.1}%"),
                    None => "progress".to_string(),
                };
                if let Some(speed) = progress.speed_bps {
                    line.push_str(&format!("  {:.1} MiB/s", speed as f64 / 1_048_576.0));
                }
                if let Some(eta) = progress.eta_seconds {
                    line.push_str(&format!("  eta {}:{:02}", eta / 60, eta % 60));
                }
                line
            }
            AppEvent::JobPostProcessing { step, .. } => format!("post     {step}"),
            AppEvent::JobCompleted { folder, files, .. } => {
                format!("done     {} ({} file(s))", folder.display(), files.len())
            }
            AppEvent::JobFailed {
                url,
                error_code,
                user_message,
                actions,
                ..
            } => {
                let mut line = format!("failed   {url} [{error_code}] {user_message}");
                for a in actions {
                    line.push_str(&format!("\n         -> {}", a.label));
                }
                line
            }
        }
    }
}

pub mod helpers {
    use super::*;

    pub fn action(kind: ActionKind, label: impl Into<String>) -> Action {
        Action {
            kind,
            label: label.into(),
        }
    }
}
