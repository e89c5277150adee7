use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::settings::{AudioFormat, UserSettings};
use crate::tools::{ResolvedTools, Tool};

/// Where to find yt-dlp.
#[derive(Debug, Clone)]
pub struct YtDlpConfig {
    /// Absolute path to the vendored `yt-dlp` binary.
    pub yt_dlp_path: PathBuf,

    /// Optional extra arguments injected into every yt-dlp call (e.g., proxy).
    pub global_args: Vec<String>,

    /// Timeout for metadata enumeration calls (not for downloads).
    pub metadata_timeout: Duration,
}

impl YtDlpConfig {
    pub fn new(yt_dlp_path: PathBuf) -> Self {
        Self {
            yt_dlp_path,
            global_args: vec![],
            metadata_timeout: Duration::from_secs(120),
        }
    }
}

/// What a single item looks like before download.
#[derive(Debug, Clone, Default)]
pub struct ItemMetadata {
    pub url: String,
    pub id: String,
    pub title: Option<String>,
    /// `YYYYMMDD` as reported by the extractor.
    pub upload_date: Option<String>,
    pub uploader: Option<String>,
    pub duration_seconds: Option<u64>,
}

/// A single playlist entry returned by enumeration.
#[derive(Debug, Clone)]
pub struct PlaylistEntry {
    pub url: String,
    pub title: Option<String>,
}

/// Result of looking at a URL: a single item or a playlist to expand.
#[derive(Debug, Clone)]
pub enum Probe {
    Item(ItemMetadata),
    Playlist {
        title: Option<String>,
        entries: Vec<PlaylistEntry>,
    },
}

/// Low-level execution result.
#[derive(Debug, Clone)]
pub struct YtDlpOutput {
    /// Raw stdout lines captured (bounded).
    pub stdout_lines: Vec<String>,
    /// Raw stderr lines captured (bounded).
    pub stderr_lines: Vec<String>,
    /// Exit code if available.
    pub exit_code: Option<i32>,
}

/// Error categories we can map to user-facing remediation later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum YtDlpErrorKind {
    NotFound,
    Timeout,
    InvalidJson,
    NonZeroExit,
}

#[derive(Debug)]
pub struct YtDlpError {
    pub kind: YtDlpErrorKind,
    pub message: String,
    pub output: Option<YtDlpOutput>,
}

impl YtDlpError {
    /// Captured stderr, for error classification.
    pub fn stderr(&self) -> String {
        self.output
            .as_ref()
            .map(|o| o.stderr_lines.join("\n"))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for YtDlpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for YtDlpError {}

/// Primary runner for metadata and playlist operations.
#[derive(Debug, Clone)]
pub struct YtDlpRunner {
    cfg: YtDlpConfig,
}

impl YtDlpRunner {
    pub fn new(cfg: YtDlpConfig) -> Self {
        Self { cfg }
    }

    pub fn yt_dlp_path(&self) -> &Path {
        &self.cfg.yt_dlp_path
    }

    /// Decide whether `url` is a playlist (flat enumeration) or one item.
    pub async fn probe(&self, url: &str) -> Result<Probe> {
        let args = vec![
            "--dump-single-json".to_string(),
            "--flat-playlist".to_string(),
            "--no-warnings".to_string(),
            url.to_string(),
        ];

        let (json_lines, _output) = self
            .exec_json_lines(&args, self.cfg.metadata_timeout)
            .await?;
        let first = json_lines
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("yt-dlp returned no JSON output"))?;

        parse_probe(&first, url)
    }

    /// Fetch full metadata for a single item via `yt-dlp --dump-json`.
    pub async fn fetch_metadata(&self, url: &str) -> Result<ItemMetadata> {
        let args = vec![
            "--dump-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            url.to_string(),
        ];

        let (json_lines, _output) = self
            .exec_json_lines(&args, self.cfg.metadata_timeout)
            .await?;
        let first = json_lines
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("yt-dlp returned no JSON output"))?;

        let v = parse_json(&first)?;
        parse_item_metadata(&v, url)
    }

    /// Execute yt-dlp and return each stdout line that parses as a JSON object.
    ///
    /// - Captures bounded stdout/stderr logs for diagnostics.
    /// - Fails on non-zero exit.
    async fn exec_json_lines(
        &self,
        args: &[String],
        timeout: Duration,
    ) -> Result<(Vec<String>, YtDlpOutput)> {
        if !self.cfg.yt_dlp_path.exists() {
            return Err(YtDlpError {
                kind: YtDlpErrorKind::NotFound,
                message: format!("yt-dlp not found at {}", self.cfg.yt_dlp_path.display()),
                output: None,
            }
            .into());
        }

        let mut cmd = Command::new(&self.cfg.yt_dlp_path);
        cmd.args(&self.cfg.global_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Hide console window on Windows
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().with_context(|| {
            format!("failed to spawn yt-dlp: {}", self.cfg.yt_dlp_path.display())
        })?;

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

        // Bound log capture to avoid unbounded memory use.
        const MAX_STDOUT_LINES: usize = 20_000;
        const MAX_STDERR_LINES: usize = 20_000;

        let mut stdout_lines: Vec<String> = Vec::new();
        let mut stderr_lines: Vec<String> = Vec::new();
        let mut json_lines: Vec<String> = Vec::new();

        let read_task = async {
            let mut stderr_open = true;
            loop {
                tokio::select! {
                    line = stdout_reader.next_line() => {
                        match line {
                            Ok(Some(l)) => {
                                if looks_like_json_object(&l) {
                                    json_lines.push(l);
                                } else if stdout_lines.len() < MAX_STDOUT_LINES {
                                    stdout_lines.push(l);
                                }
                            }
                            Ok(None) => break,
                            Err(e) => return Err(anyhow!("error reading yt-dlp stdout: {e}")),
                        }
                    }
                    line = stderr_reader.next_line(), if stderr_open => {
                        match line {
                            Ok(Some(l)) => {
                                if stderr_lines.len() < MAX_STDERR_LINES {
                                    stderr_lines.push(l);
                                }
                            }
                            Ok(None) => stderr_open = false,
                            Err(e) => return Err(anyhow!("error reading yt-dlp stderr: {e}")),
                        }
                    }
                }
            }
            // Drain whatever stderr is left after stdout closed.
            while stderr_open {
                match stderr_reader.next_line().await {
                    Ok(Some(l)) if stderr_lines.len() < MAX_STDERR_LINES => stderr_lines.push(l),
                    Ok(Some(_)) => {}
                    _ => stderr_open = false,
                }
            }
            Ok::<(), anyhow::Error>(())
        };

        match tokio::time::timeout(timeout, read_task).await {
            Ok(read) => read?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(YtDlpError {
                    kind: YtDlpErrorKind::Timeout,
                    message: format!("yt-dlp timed out after {:?}", timeout),
                    output: Some(YtDlpOutput {
                        stdout_lines,
                        stderr_lines,
                        exit_code: None,
                    }),
                }
                .into());
            }
        }

        let status = child.wait().await?;
        let exit_code = status.code();

        let output = YtDlpOutput {
            stdout_lines,
            stderr_lines,
            exit_code,
        };

        if !status.success() {
            return Err(YtDlpError {
                kind: YtDlpErrorKind::NonZeroExit,
                message: format!("yt-dlp exited with status {:?}", exit_code),
                output: Some(output),
            }
            .into());
        }

        Ok((json_lines, output))
    }
}

fn looks_like_json_object(s: &str) -> bool {
    let t = s.trim();
    t.starts_with('{') && t.ends_with('}')
}

fn parse_json(line: &str) -> Result<Value> {
    serde_json::from_str(line).map_err(|e| {
        YtDlpError {
            kind: YtDlpErrorKind::InvalidJson,
            message: format!("invalid yt-dlp JSON: {e}"),
            output: None,
        }
        .into()
    })
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(|x| x.as_str()).map(str::to_string)
}

fn parse_probe(json_line: &str, url: &str) -> Result<Probe> {
    let v = parse_json(json_line)?;

    let is_playlist = v.get("_type").and_then(|x| x.as_str()) == Some("playlist")
        || v.get("entries").is_some();
    if !is_playlist {
        return parse_item_metadata(&v, url).map(Probe::Item);
    }

    let entries = v
        .get("entries")
        .and_then(|e| e.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|e| parse_playlist_entry(e, url).ok())
                .collect()
        })
        .unwrap_or_default();

    Ok(Probe::Playlist {
        title: str_field(&v, "title"),
        entries,
    })
}

fn parse_item_metadata(v: &Value, fallback_url: &str) -> Result<ItemMetadata> {
    let id = str_field(v, "id").ok_or_else(|| anyhow!("yt-dlp metadata has no id"))?;

    let duration_seconds = v
        .get("duration")
        .and_then(|x| x.as_u64())
        .or_else(|| v.get("duration").and_then(|x| x.as_f64()).map(|f| f as u64));

    Ok(ItemMetadata {
        url: str_field(v, "webpage_url").unwrap_or_else(|| fallback_url.to_string()),
        id,
        title: str_field(v, "title"),
        upload_date: str_field(v, "upload_date"),
        uploader: str_field(v, "uploader"),
        duration_seconds,
    })
}

fn parse_playlist_entry(v: &Value, playlist_url: &str) -> Result<PlaylistEntry> {
    let title = str_field(v, "title");

    // Prefer `webpage_url` if present.
    if let Some(u) = v.get("webpage_url").and_then(|x| x.as_str()) {
        return Ok(PlaylistEntry {
            url: u.to_string(),
            title,
        });
    }

    if let Some(u) = v.get("url").and_then(|x| x.as_str()) {
        if u.starts_with("http://") || u.starts_with("https://") {
            return Ok(PlaylistEntry {
                url: u.to_string(),
                title,
            });
        }

        // Relative entry URL: resolve against the playlist's origin.
        if let Ok(joined) = url::Url::parse(playlist_url).and_then(|base| base.join(u)) {
            return Ok(PlaylistEntry {
                url: joined.to_string(),
                title,
            });
        }
    }

    // Last resort: a bare id, which yt-dlp accepts for the same extractor.
    if let Some(id) = v.get("id").and_then(|x| x.as_str()) {
        return Ok(PlaylistEntry {
            url: id.to_string(),
            title,
        });
    }

    Err(anyhow!("playlist entry missing url/webpage_url/id"))
}

// ---------------------------------------------------------------------------
// Format selection

/// `[language^=xx]`, or nothing for the default track.
pub fn lang_filter(code: &str) -> String {
    let code = code.trim();
    if code.is_empty() || code == "default" {
        return String::new();
    }
    format!("[language^={code}]")
}

/// `[tbr<=N]` bitrate cap, or nothing when unset.
pub fn tbr_filter(kbps: Option<u32>) -> String {
    match kbps {
        Some(v) if v > 0 => format!("[tbr<={v}]"),
        _ => String::new(),
    }
}

/// Above 1080p streams are often VP9/AV1, which only MKV merges reliably.
pub fn choose_merge_output_format(default_fmt: &str, max_height: Option<u32>) -> String {
    match max_height {
        Some(h) if h > 1080 => "mkv".to_string(),
        _ => default_fmt.to_string(),
    }
}

/// Video format selector.
///
/// Up to 1080p H.264+AAC is tried first. Above 1080p resolution comes first,
/// since H.264 is rarely offered there and would cap the result at 1080p.
pub fn build_video_format(
    max_height: Option<u32>,
    max_video_bitrate_kbps: Option<u32>,
    audio_lang: &str,
) -> String {
    let h = max_height
        .map(|h| format!("[height<={h}]"))
        .unwrap_or_default();
    let br = tbr_filter(max_video_bitrate_kbps);
    let lang = lang_filter(audio_lang);

    let mp4_pref = [
        format!("bv*{h}[vcodec^=avc1]{br}+ba[acodec^=mp4a]{lang}"),
        format!("bv*{h}[vcodec^=avc1]{br}+ba[acodec^=mp4a]"),
    ];
    let any_codec = [format!("bv*{h}{br}+ba{lang}"), format!("bv*{h}{br}+ba")];
    let last_resort = format!("b{h}{br}");

    let mut candidates: Vec<String> = Vec::with_capacity(5);
    if matches!(max_height, Some(h) if h > 1080) {
        candidates.extend(any_codec);
        candidates.extend(mp4_pref);
    } else {
        candidates.extend(mp4_pref);
        candidates.extend(any_codec);
    }
    candidates.push(last_resort);
    candidates.join("/")
}

/// Audio-only format selector with optional track language.
pub fn build_audio_only_format(format: AudioFormat, audio_lang: &str) -> String {
    let lang = lang_filter(audio_lang);
    match (format, lang.is_empty()) {
        (AudioFormat::M4a, true) => "bestaudio[ext=m4a]/bestaudio/b".to_string(),
        (AudioFormat::M4a, false) => {
            format!("bestaudio[ext=m4a]{lang}/bestaudio{lang}/bestaudio[ext=m4a]/bestaudio/b")
        }
        (AudioFormat::Mp3, true) => "bestaudio/b".to_string(),
        (AudioFormat::Mp3, false) => format!("bestaudio{lang}/bestaudio/b"),
    }
}

/// Subtitle template inside the item folder; the language is upper-cased afterwards.
pub const SUBTITLE_TEMPLATE: &str = "subtitle:%(id)s-%(language)s.%(ext)s";

/// Per-run options not stored in settings.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
}

/// Arguments for downloading one item into `folder`.
pub fn build_download_args(
    settings: &UserSettings,
    tools: &ResolvedTools,
    folder: &Path,
    archive: &Path,
    run: &RunOptions,
    url: &str,
) -> Vec<String> {
    let d = &settings.download;
    let net = &settings.network;

    let mut args: Vec<String> = vec![
        "--newline".into(),
        "--no-colors".into(),
        "--no-playlist".into(),
        "--windows-filenames".into(),
        "-P".into(),
        folder.to_string_lossy().into_owned(),
        "-o".into(),
        d.media_template(),
        "-o".into(),
        SUBTITLE_TEMPLATE.into(),
        "--download-archive".into(),
        archive.to_string_lossy().into_owned(),
        "--retries".into(),
        net.retries.to_string(),
        "--fragment-retries".into(),
        net.fragment_retries.to_string(),
        "--concurrent-fragments".into(),
        net.concurrent_fragments.max(1).to_string(),
    ];

    args.push("-f".into());
    if d.audio_only {
        args.push(build_audio_only_format(d.audio_format, &d.audio_track_lang));
        if d.audio_format == AudioFormat::Mp3 {
            args.extend([
                "--extract-audio".to_string(),
                "--audio-format".to_string(),
                "mp3".to_string(),
                "--audio-quality".to_string(),
                "0".to_string(),
            ]);
        }
    } else {
        args.push(build_video_format(
            d.max_height,
            d.max_video_bitrate_kbps,
            &d.audio_track_lang,
        ));
        args.push("--merge-output-format".into());
        args.push(choose_merge_output_format(
            &d.merge_output_format,
            d.max_height,
        ));
    }

    if settings.subtitles.enabled {
        let mut langs: Vec<&str> = Vec::new();
        for l in settings.subtitles.languages.iter().map(|l| l.trim()) {
            if !l.is_empty() && !langs.contains(&l) {
                langs.push(l);
            }
        }
        if !langs.is_empty() {
            args.extend([
                "--write-subs".to_string(),
                "--write-auto-subs".to_string(),
                "--sub-langs".to_string(),
                langs.join(","),
            ]);
            // Spacing out several subtitle requests avoids HTTP 429.
            if langs.len() >= 3 {
                args.extend([
                    "--sleep-interval".to_string(),
                    "1".to_string(),
                    "--max-sleep-interval".to_string(),
                    "3".to_string(),
                ]);
            }
        }
    }

    if let Some(ffmpeg) = tools.get(Tool::Ffmpeg) {
        let location = ffmpeg.parent().unwrap_or(ffmpeg);
        args.push("--ffmpeg-location".into());
        args.push(location.to_string_lossy().into_owned());
    }

    if let Some(deno) = tools.get(Tool::Deno) {
        args.push("--js-runtimes".into());
        args.push(format!("deno:{}", deno.display()));
        args.push("--remote-components".into());
        args.push("ejs:github".into());
    }

    if run.dry_run {
        args.push("--simulate".into());
    }

    args.push("--".into());
    args.push(url.to_string());
    args
}
