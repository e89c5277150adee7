//! Tool Directory Manager
//!
//! Declares the vendored third-party binaries and resolves them inside the
//! install root's `tools/` directory. Resolution is a pure path + existence
//! check; nothing here downloads or modifies files.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::LifecycleError;

/// Vendored tools shipped alongside the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    YtDlp,
    Ffmpeg,
    Ffprobe,
    Ffplay,
    Deno,
}

/// What a tool is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolRole {
    Extractor,
    Transcoder,
    Prober,
    Player,
    ScriptRuntime,
}

impl Tool {
    pub const ALL: [Tool; 5] = [
        Tool::YtDlp,
        Tool::Ffmpeg,
        Tool::Ffprobe,
        Tool::Ffplay,
        Tool::Deno,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::YtDlp => "yt-dlp",
            Tool::Ffmpeg => "ffmpeg",
            Tool::Ffprobe => "ffprobe",
            Tool::Ffplay => "ffplay",
            Tool::Deno => "deno",
        }
    }

    pub fn role(&self) -> ToolRole {
        match self {
            Tool::YtDlp => ToolRole::Extractor,
            Tool::Ffmpeg => ToolRole::Transcoder,
            Tool::Ffprobe => ToolRole::Prober,
            Tool::Ffplay => ToolRole::Player,
            Tool::Deno => ToolRole::ScriptRuntime,
        }
    }

    pub fn binary_name(&self) -> &'static str {
        #[cfg(target_os = "windows")]
        {
            match self {
                Tool::YtDlp => "yt-dlp.exe",
                Tool::Ffmpeg => "ffmpeg.exe",
                Tool::Ffprobe => "ffprobe.exe",
                Tool::Ffplay => "ffplay.exe",
                Tool::Deno => "deno.exe",
            }
        }
        #[cfg(not(target_os = "windows"))]
        {
            self.as_str()
        }
    }

    pub fn version_args(&self) -> &[&str] {
        match self {
            Tool::YtDlp | Tool::Deno => &["--version"],
            Tool::Ffmpeg | Tool::Ffprobe | Tool::Ffplay => &["-version"],
        }
    }

    /// Built-in download source for the current platform, if any.
    pub fn default_source(&self) -> Option<ToolSource> {
        default_source(*self)
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tool {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Tool::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                anyhow!(
                    "unknown tool '{}' (expected one of: yt-dlp, ffmpeg, ffprobe, ffplay, deno)",
                    s
                )
            })
    }
}

/// How a fetched artifact turns into the tool binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ArtifactFormat {
    /// The download is the binary itself.
    Raw,
    /// Extract the first entry whose file name equals `member`
    /// (entries under a `bin/` directory win).
    Zip { member: String },
    TarXz { member: String },
}

/// Where updates for a tool come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSource {
    pub url: String,
    pub format: ArtifactFormat,
}

impl ToolSource {
    fn raw(url: &str) -> Self {
        Self {
            url: url.to_string(),
            format: ArtifactFormat::Raw,
        }
    }

    fn zip(url: &str, member: &str) -> Self {
        Self {
            url: url.to_string(),
            format: ArtifactFormat::Zip {
                member: member.to_string(),
            },
        }
    }

    #[cfg_attr(not(all(unix, not(target_os = "macos"))), allow(dead_code))]
    fn tar_xz(url: &str, member: &str) -> Self {
        Self {
            url: url.to_string(),
            format: ArtifactFormat::TarXz {
                member: member.to_string(),
            },
        }
    }
}

#[cfg(target_os = "windows")]
fn default_source(tool: Tool) -> Option<ToolSource> {
    const FFMPEG_ESSENTIALS: &str = "https://www.gyan.dev/ffmpeg/builds/ffmpeg-release-essentials.zip";
    Some(match tool {
        Tool::YtDlp => {
            ToolSource::raw("https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp.exe")
        }
        Tool::Ffmpeg | Tool::Ffprobe | Tool::Ffplay => {
            ToolSource::zip(FFMPEG_ESSENTIALS, tool.binary_name())
        }
        Tool::Deno => ToolSource::zip(
            "https://github.com/denoland/deno/releases/latest/download/deno-x86_64-pc-windows-msvc.zip",
            "deno.exe",
        ),
    })
}

#[cfg(target_os = "macos")]
fn default_source(tool: Tool) -> Option<ToolSource> {
    Some(match tool {
        Tool::YtDlp => {
            ToolSource::raw("https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_macos")
        }
        Tool::Ffmpeg => ToolSource::zip("https://evermeet.cx/ffmpeg/getrelease/zip", "ffmpeg"),
        Tool::Ffprobe => {
            ToolSource::zip("https://evermeet.cx/ffmpeg/getrelease/ffprobe/zip", "ffprobe")
        }
        Tool::Ffplay => ToolSource::zip("https://evermeet.cx/ffmpeg/getrelease/ffplay/zip", "ffplay"),
        Tool::Deno => ToolSource::zip(
            "https://github.com/denoland/deno/releases/latest/download/deno-aarch64-apple-darwin.zip",
            "deno",
        ),
    })
}

#[cfg(all(unix, not(target_os = "macos")))]
fn default_source(tool: Tool) -> Option<ToolSource> {
    const FFMPEG_STATIC: &str =
        "https://johnvansickle.com/ffmpeg/releases/ffmpeg-release-amd64-static.tar.xz";
    match tool {
        Tool::YtDlp => Some(ToolSource::raw(
            "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_linux",
        )),
        Tool::Ffmpeg => Some(ToolSource::tar_xz(FFMPEG_STATIC, "ffmpeg")),
        Tool::Ffprobe => Some(ToolSource::tar_xz(FFMPEG_STATIC, "ffprobe")),
        // Static Linux builds ship without a player.
        Tool::Ffplay => None,
        Tool::Deno => Some(ToolSource::zip(
            "https://github.com/denoland/deno/releases/latest/download/deno-x86_64-unknown-linux-gnu.zip",
            "deno",
        )),
    }
}

/// Presence information for one tool, for the `tools` report.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub tool: Tool,
    pub role: ToolRole,
    pub path: PathBuf,
    pub present: bool,
    pub size_bytes: Option<u64>,
    /// A copy on the system PATH. Informational; never used to run jobs.
    pub system_copy: Option<PathBuf>,
}

/// Paths of the tools a job may invoke.
#[derive(Debug, Clone, Default)]
pub struct ResolvedTools {
    paths: HashMap<Tool, PathBuf>,
}

impl ResolvedTools {
    pub fn get(&self, tool: Tool) -> Option<&Path> {
        self.paths.get(&tool).map(PathBuf::as_path)
    }

    pub fn tools(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self.paths.keys().copied().collect();
        tools.sort();
        tools
    }
}

/// Resolves vendored tools under `<root>/tools`.
#[derive(Debug, Clone)]
pub struct ToolDirectory {
    dir: PathBuf,
}

impl ToolDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Expected location of a tool, whether or not it exists.
    pub fn path(&self, tool: Tool) -> PathBuf {
        self.dir.join(tool.binary_name())
    }

    pub fn is_present(&self, tool: Tool) -> bool {
        self.path(tool).is_file()
    }

    pub fn resolve(&self, tool: Tool) -> Result<PathBuf, LifecycleError> {
        let path = self.path(tool);
        if path.is_file() {
            Ok(path)
        } else {
            Err(LifecycleError::ToolUnavailable {
                tool,
                expected: path,
            })
        }
    }

    /// Resolve every `required` tool (first missing one is an error) and
    /// whichever `optional` tools happen to be present.
    pub fn resolve_set(
        &self,
        required: &[Tool],
        optional: &[Tool],
    ) -> Result<ResolvedTools, LifecycleError> {
        let mut paths = HashMap::new();
        for &tool in required {
            paths.insert(tool, self.resolve(tool)?);
        }
        for &tool in optional {
            if let Ok(p) = self.resolve(tool) {
                paths.entry(tool).or_insert(p);
            }
        }
        Ok(ResolvedTools { paths })
    }

    pub fn info(&self, tool: Tool) -> ToolInfo {
        let path = self.path(tool);
        let size_bytes = std::fs::metadata(&path)
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len());
        ToolInfo {
            tool,
            role: tool.role(),
            present: size_bytes.is_some(),
            size_bytes,
            system_copy: which::which(tool.binary_name()).ok(),
            path,
        }
    }

    pub fn status(&self) -> Vec<ToolInfo> {
        Tool::ALL.iter().map(|&t| self.info(t)).collect()
    }
}

/// Run the tool's version flag and parse the first line of its output.
pub async fn probe_version(path: &Path, tool: Tool, timeout: Duration) -> Result<String> {
    let mut cmd = Command::new(path);
    cmd.args(tool.version_args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Hide console window on Windows
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .context("Version check timed out")?
        .with_context(|| format!("Failed to execute {}", path.display()))?;

    if !output.status.success() {
        return Err(anyhow!(
            "{} returned non-zero exit code: {}",
            tool,
            output.status
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_version(&stdout, tool).ok_or_else(|| anyhow!("Could not parse {} version", tool))
}

/// Parse version string from tool output.
fn parse_version(output: &str, tool: Tool) -> Option<String> {
    let first_line = output.lines().next()?.trim();
    if first_line.is_empty() {
        return None;
    }

    match tool {
        // "2025.01.15"
        Tool::YtDlp => Some(first_line.to_string()),
        // "ffmpeg version 7.1-essentials_build-www.gyan.dev Copyright ..."
        Tool::Ffmpeg | Tool::Ffprobe | Tool::Ffplay => {
            let parts: Vec<&str> = first_line.split_whitespace().collect();
            if parts.len() >= 3 && parts[1] == "version" {
                Some(parts[2].to_string())
            } else {
                Some(first_line.to_string())
            }
        }
        // "deno 2.1.4 (stable, release, x86_64-pc-windows-msvc)"
        Tool::Deno => first_line
            .split_whitespace()
            .nth(1)
            .map(str::to_string)
            .or_else(|| Some(first_line.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_version_ytdlp() {
        assert_eq!(
            parse_version("2024.01.01\n", Tool::YtDlp),
            Some("2024.01.01".to_string())
        );
    }

    #[test]
    fn test_parse_version_ffmpeg() {
        let output = "ffmpeg version 6.1.1 Copyright (c) 2000-2023 the FFmpeg developers\n";
        assert_eq!(
            parse_version(output, Tool::Ffmpeg),
            Some("6.1.1".to_string())
        );
        let output = "ffprobe version 7.1-essentials_build-www.gyan.dev Copyright\n";
        assert_eq!(
            parse_version(output, Tool::Ffprobe),
            Some("7.1-essentials_build-www.gyan.dev".to_string())
        );
    }

    #[test]
    fn test_parse_version_deno() {
        let output = "deno 2.1.4 (stable, release, x86_64-pc-windows-msvc)\nv8 13.0\n";
        assert_eq!(parse_version(output, Tool::Deno), Some("2.1.4".to_string()));
    }

    #[test]
    fn test_tool_binary_names() {
        #[cfg(target_os = "windows")]
        {
            assert_eq!(Tool::YtDlp.binary_name(), "yt-dlp.exe");
            assert_eq!(Tool::Deno.binary_name(), "deno.exe");
        }
        #[cfg(not(target_os = "windows"))]
        {
            assert_eq!(Tool::YtDlp.binary_name(), "yt-dlp");
            assert_eq!(Tool::Deno.binary_name(), "deno");
        }
    }

    #[test]
    fn tool_names_parse() {
        assert_eq!("yt-dlp".parse::<Tool>().unwrap(), Tool::YtDlp);
        assert_eq!("FFmpeg".parse::<Tool>().unwrap(), Tool::Ffmpeg);
        assert!("youtube-dl".parse::<Tool>().is_err());
    }

    #[test]
    fn missing_required_tool_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let tools = ToolDirectory::new(dir.path());
        fs::write(tools.path(Tool::YtDlp), b"bin").unwrap();

        let resolved = tools
            .resolve_set(&[Tool::YtDlp], &[Tool::Ffmpeg, Tool::Deno])
            .unwrap();
        assert_eq!(resolved.tools(), vec![Tool::YtDlp]);
        assert_eq!(resolved.get(Tool::YtDlp), Some(tools.path(Tool::YtDlp).as_path()));

        match tools.resolve_set(&[Tool::YtDlp, Tool::Ffmpeg], &[]) {
            Err(LifecycleError::ToolUnavailable { tool, expected }) => {
                assert_eq!(tool, Tool::Ffmpeg);
                assert_eq!(expected, tools.path(Tool::Ffmpeg));
            }
            other => panic!("expected ToolUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn status_reports_presence_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let tools = ToolDirectory::new(dir.path());
        fs::write(tools.path(Tool::Deno), b"12345").unwrap();

        let status = tools.status();
        assert_eq!(status.len(), Tool::ALL.len());
        let deno = status.iter().find(|i| i.tool == Tool::Deno).unwrap();
        assert!(deno.present);
        assert_eq!(deno.size_bytes, Some(5));
        assert!(!status.iter().find(|i| i.tool == Tool::YtDlp).unwrap().present);
    }

    #[test]
    fn every_tool_except_player_has_a_source() {
        for tool in [Tool::YtDlp, Tool::Ffmpeg, Tool::Ffprobe, Tool::Deno] {
            assert!(tool.default_source().is_some(), "{tool}");
        }
    }
}
