//! Error taxonomy for the install / update / download lifecycle.
//!
//! Plumbing code uses `anyhow::Result` with context; the variants here are the
//! conditions a caller has to branch on, and each one names the resource that
//! failed so the message is actionable on its own.

use std::path::PathBuf;

use thiserror::Error;

use crate::events::ErrorCode;
use crate::tools::Tool;

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The source bundle is missing a file the installer cannot do without.
    #[error("required bundle artifact missing: expected {}", expected.display())]
    MissingBundleArtifact { expected: PathBuf },

    /// A vendored tool is not present in the install root.
    #[error(
        "{} is not installed (expected at {}). Run `vod-downloader update-tools {}` to fetch it.",
        tool.as_str(),
        expected.display(),
        tool.as_str()
    )]
    ToolUnavailable { tool: Tool, expected: PathBuf },

    /// A tool could not be refreshed; the previous file is left in place.
    #[error("updating {} failed: {reason}. The previous version was kept; retry with `vod-downloader update-tools {}`.", tool.as_str(), tool.as_str())]
    ToolUpdateFailed { tool: Tool, reason: String },

    /// A tool stayed busy for longer than the update was willing to wait.
    #[error("{} is in use by {in_use} running job(s)", tool.as_str())]
    ToolInUse { tool: Tool, in_use: usize },

    /// A single download item failed; other items are unaffected.
    #[error("download failed for {url}: {message}")]
    DownloadJobFailed {
        url: String,
        code: ErrorCode,
        message: String,
    },

    /// The OS refused to create an entry point. Installation still succeeds.
    #[error("could not create shortcut {}: {reason}", link.display())]
    ShortcutCreationFailed { link: PathBuf, reason: String },
}

impl LifecycleError {
    /// Process exit code used by the CLI when this error ends a command.
    pub fn exit_code(&self) -> i32 {
        match self {
            LifecycleError::MissingBundleArtifact { .. } => 1,
            _ => 2,
        }
    }
}
