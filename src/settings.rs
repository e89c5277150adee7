//! Settings Manager
//!
//! Handles persistence and retrieval of user preferences using SQLite.
//! Settings are stored as JSON values keyed by setting name.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// User settings structure with all configurable options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default)]
    pub download: DownloadSettings,

    #[serde(default)]
    pub subtitles: SubtitleSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub updates: UpdateSettings,
}

/// Audio-only output preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Native AAC stream, no conversion.
    #[default]
    M4a,
    /// Best audio converted by ffmpeg.
    Mp3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    /// Output root. Relative paths are resolved against the install root.
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,

    /// Skip items uploaded before this date (`YYYY-MM-DD` or `YYYYMMDD`).
    #[serde(default)]
    pub after: Option<String>,

    /// Maximum video height; `None` means best available.
    #[serde(default)]
    pub max_height: Option<u32>,

    /// Cap on the selected video stream's total bitrate.
    #[serde(default)]
    pub max_video_bitrate_kbps: Option<u32>,

    /// Audio track language code, or `default` for the original track.
    #[serde(default = "default_audio_track_lang")]
    pub audio_track_lang: String,

    #[serde(default)]
    pub audio_only: bool,

    #[serde(default)]
    pub audio_format: AudioFormat,

    /// Container used when merging streams up to 1080p.
    #[serde(default = "default_merge_output_format")]
    pub merge_output_format: String,

    /// Media file name template inside the item folder. Must start with
    /// `%(id)s`; outputs are found by the item ID.
    #[serde(default = "default_file_template")]
    pub file_template: String,

    /// Title bytes kept in the item folder name.
    #[serde(default = "default_title_max_bytes")]
    pub title_max_bytes: usize,

    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    #[serde(default)]
    pub open_folder_after: bool,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            out_dir: default_out_dir(),
            after: None,
            max_height: None,
            max_video_bitrate_kbps: None,
            audio_track_lang: default_audio_track_lang(),
            audio_only: false,
            audio_format: AudioFormat::default(),
            merge_output_format: default_merge_output_format(),
            file_template: default_file_template(),
            title_max_bytes: default_title_max_bytes(),
            concurrency: default_concurrency(),
            open_folder_after: false,
        }
    }
}

impl DownloadSettings {
    /// The configured file template, or the default when it would not name
    /// files after the item ID.
    pub fn media_template(&self) -> String {
        match check_file_template(&self.file_template) {
            Ok(()) => self.file_template.clone(),
            Err(e) => {
                log::warn!("{:#}; using {}", e, default_file_template());
                default_file_template()
            }
        }
    }

    pub fn resolved_out_dir(&self, root: &Path) -> PathBuf {
        if self.out_dir.is_absolute() {
            self.out_dir.clone()
        } else {
            root.join(&self.out_dir)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Requested languages, manual and automatic tracks alike.
    #[serde(default = "default_subtitle_languages")]
    pub languages: Vec<String>,
}

impl Default for SubtitleSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            languages: default_subtitle_languages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_retries")]
    pub fragment_retries: u32,

    #[serde(default = "default_concurrent_fragments")]
    pub concurrent_fragments: u32,

    /// Bound on metadata and playlist lookups.
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_secs: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            fragment_retries: default_retries(),
            concurrent_fragments: default_concurrent_fragments(),
            metadata_timeout_secs: default_metadata_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSettings {
    /// JSON manifest with pinned versions and checksums. Built-in sources
    /// are used when unset.
    #[serde(default)]
    pub manifest_url: Option<String>,

    /// How long an update waits for running jobs to release a tool.
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            manifest_url: None,
            wait_secs: default_wait_secs(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_audio_track_lang() -> String {
    "default".to_string()
}

fn default_merge_output_format() -> String {
    "mp4".to_string()
}

fn default_file_template() -> String {
    "%(id)s.%(ext)s".to_string()
}

/// Media files are matched by `<ItemID>` prefix, so templates must start there.
pub fn check_file_template(template: &str) -> Result<()> {
    let template = template.trim();
    if !template.starts_with("%(id)s") {
        bail!("file template {template:?} must start with %(id)s");
    }
    if template.contains('/') || template.contains('\\') {
        bail!("file template {template:?} must not contain a path separator");
    }
    Ok(())
}

fn default_title_max_bytes() -> usize {
    120
}

fn default_concurrency() -> u32 {
    2
}

fn default_subtitle_languages() -> Vec<String> {
    vec!["hu".to_string(), "en".to_string()]
}

fn default_retries() -> u32 {
    10
}

fn default_concurrent_fragments() -> u32 {
    4
}

fn default_metadata_timeout() -> u64 {
    120
}

fn default_wait_secs() -> u64 {
    300
}

fn default_fetch_timeout() -> u64 {
    600
}

/// Audio track languages offered for selection: (label, code).
pub const AUDIO_TRACK_LANGS: &[(&str, &str)] = &[
    ("Default (original)", "default"),
    ("English", "en"),
    ("German", "de"),
    ("Italian", "it"),
    ("French", "fr"),
    ("Spanish", "es"),
    ("Polish", "pl"),
    ("Czech", "cs"),
    ("Slovak", "sk"),
    ("Hungarian", "hu"),
];

/// Bitrate cap labels: (label, kbps).
pub const BITRATE_PRESETS: &[(&str, Option<u32>)] = &[
    ("No limit", None),
    ("2 Mbps", Some(2000)),
    ("4 Mbps", Some(4000)),
    ("6 Mbps", Some(6000)),
    ("8 Mbps", Some(8000)),
    ("12 Mbps", Some(12000)),
    ("20 Mbps", Some(20000)),
    ("40 Mbps", Some(40000)),
];

/// Quality labels, current and from older builds: (label, max height).
const QUALITY_LABELS: &[(&str, Option<u32>)] = &[
    ("Best available (H.264+AAC MP4 preferred)", None),
    ("Best (H.264+AAC MP4 recommended)", None),
    ("Best (H.264+AAC MP4 ajánlott)", None),
    ("2160p max (4K)", Some(2160)),
    ("2160p max", Some(2160)),
    ("Up to 2160p", Some(2160)),
    ("1440p max (2K)", Some(1440)),
    ("1440p max", Some(1440)),
    ("Up to 1440p", Some(1440)),
    ("1080p max", Some(1080)),
    ("Up to 1080p", Some(1080)),
    ("720p max", Some(720)),
    ("Up to 720p", Some(720)),
    ("480p max", Some(480)),
    ("Up to 480p", Some(480)),
];

/// Normalize an "after" date to `YYYYMMDD`.
pub fn parse_after_date(s: &str) -> Result<Option<String>> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    if s.contains('-') {
        let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|_| anyhow!("after date must be YYYY-MM-DD or YYYYMMDD, got {s:?}"))?;
        return Ok(Some(date.format("%Y%m%d").to_string()));
    }
    if s.len() == 8 && s.chars().all(|c| c.is_ascii_digit()) {
        return Ok(Some(s.to_string()));
    }
    bail!("after date must be YYYY-MM-DD or YYYYMMDD, got {s:?}")
}

/// Flags given to a single `download` run. They change the settings for that
/// run only and are never saved.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub audio_only: bool,
    pub out_dir: Option<PathBuf>,
    /// Comma separated language codes; an empty list turns subtitles off.
    pub subtitles: Option<String>,
    /// Maximum height; `0` lifts the limit.
    pub max_height: Option<u32>,
}

impl RunOverrides {
    pub fn apply(&self, settings: &UserSettings) -> UserSettings {
        let mut s = settings.clone();
        if self.audio_only {
            s.download.audio_only = true;
        }
        if let Some(out) = &self.out_dir {
            s.download.out_dir = out.clone();
        }
        if let Some(raw) = &self.subtitles {
            let langs: Vec<String> = raw
                .split(',')
                .map(|l| l.trim().to_lowercase())
                .filter(|l| !l.is_empty())
                .collect();
            s.subtitles.enabled = !langs.is_empty();
            s.subtitles.languages = langs;
        }
        if let Some(h) = self.max_height {
            s.download.max_height = (h > 0).then_some(h);
        }
        s
    }
}

/// Settings keys used in the database.
pub mod keys {
    pub const USER_SETTINGS: &str = "user_settings";
}

/// Settings manager for reading and writing settings to the database.
pub struct SettingsManager<'a> {
    conn: &'a Connection,
}

impl<'a> SettingsManager<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Get a setting value by key.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let result: Option<String> = self
            .conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query settings")?;

        match result {
            Some(json) => {
                let value: T =
                    serde_json::from_str(&json).context("Failed to deserialize setting")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Set a setting value by key.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value).context("Failed to serialize setting")?;

        self.conn
            .execute(
                "INSERT INTO settings (key, value_json) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
                params![key, json],
            )
            .context("Failed to save setting")?;

        Ok(())
    }

    /// Get the user settings, returning defaults if not set.
    pub fn get_user_settings(&self) -> Result<UserSettings> {
        self.get::<UserSettings>(keys::USER_SETTINGS)
            .map(|opt| opt.unwrap_or_default())
    }

    pub fn save_user_settings(&self, settings: &UserSettings) -> Result<()> {
        self.set(keys::USER_SETTINGS, settings)
    }

    /// Edit one value by dotted path (`download.concurrency`) and persist.
    pub fn set_path(&self, path: &str, raw: &str) -> Result<UserSettings> {
        let current = self.get_user_settings()?;
        let updated = apply_path(&current, path, raw)?;
        self.save_user_settings(&updated)?;
        Ok(updated)
    }

    /// Import a config file written by earlier builds and persist it.
    pub fn import_legacy(&self, path: &Path) -> Result<UserSettings> {
        let text =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let raw: Value = serde_json::from_str(&text)
            .with_context(|| format!("parse {}", path.display()))?;
        let settings = import_legacy_config(&raw)?;
        self.save_user_settings(&settings)?;
        Ok(settings)
    }
}

/// Return a copy of `settings` with the value at `path` replaced.
///
/// `raw` is parsed as JSON when possible (`4`, `true`, `null`, `["en"]`),
/// otherwise taken as a string. The result must still deserialize.
pub fn apply_path(settings: &UserSettings, path: &str, raw: &str) -> Result<UserSettings> {
    let mut root = serde_json::to_value(settings)?;
    let parts: Vec<&str> = path.split('.').filter(|p| !p.is_empty()).collect();
    let Some((leaf, parents)) = parts.split_last() else {
        bail!("empty settings key");
    };

    let mut node = &mut root;
    for part in parents {
        node = node
            .get_mut(*part)
            .filter(|v| v.is_object())
            .ok_or_else(|| anyhow!("unknown settings section '{part}' in '{path}'"))?;
    }
    let obj = node
        .as_object_mut()
        .ok_or_else(|| anyhow!("'{path}' does not name a setting"))?;
    if !obj.contains_key(*leaf) {
        let known: Vec<&String> = obj.keys().collect();
        bail!("unknown setting '{path}' (known here: {known:?})");
    }

    let parsed = serde_json::from_str::<Value>(raw).ok();
    let as_string = Value::String(raw.to_string());
    let retry_as_string = !matches!(parsed, None | Some(Value::String(_)));
    obj.insert(leaf.to_string(), parsed.unwrap_or_else(|| as_string.clone()));

    // `20240309` parses as a number but may be meant for a string field.
    let updated: UserSettings = match serde_json::from_value(root.clone()) {
        Ok(s) => s,
        Err(_) if retry_as_string => {
            if let Some(slot) = root.pointer_mut(&format!("/{}", parts.join("/"))) {
                *slot = as_string;
            }
            serde_json::from_value(root)
                .with_context(|| format!("invalid value {raw:?} for '{path}'"))?
        }
        Err(e) => return Err(e).with_context(|| format!("invalid value {raw:?} for '{path}'")),
    };

    if let Some(after) = &updated.download.after {
        parse_after_date(after)?;
    }
    check_file_template(&updated.download.file_template)?;
    Ok(updated)
}

/// Map the flat legacy config onto current settings.
///
/// Older builds used different key names and stored UI labels instead of
/// values; those are translated, anything unrecognised is dropped.
pub fn import_legacy_config(raw: &Value) -> Result<UserSettings> {
    let raw = raw
        .as_object()
        .ok_or_else(|| anyhow!("legacy config must be a JSON object"))?;
    let mut s = UserSettings::default();

    if let Some(v) = str_field(raw, "out_dir") {
        s.download.out_dir = PathBuf::from(v);
    }
    if let Some(v) = str_field(raw, "after") {
        s.download.after = parse_after_date(v)?.map(|_| v.trim().to_string());
    }
    if let Some(v) = raw.get("subs").and_then(Value::as_bool) {
        s.subtitles.enabled = v;
    }
    if let Some(langs) = raw.get("subs_langs").and_then(Value::as_array) {
        s.subtitles.languages = langs
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }
    if let Some(v) = raw.get("open_folder_after").and_then(Value::as_bool) {
        s.download.open_folder_after = v;
    }

    if let Some(label) = str_field(raw, "quality_label") {
        match QUALITY_LABELS.iter().find(|(l, _)| *l == label) {
            Some((_, height)) => s.download.max_height = *height,
            None => log::warn!("Unknown quality label {:?}, using best available", label),
        }
    }
    s.download.max_video_bitrate_kbps = raw
        .get("max_video_bitrate_kbps")
        .and_then(legacy_bitrate);
    if let Some(v) = str_field(raw, "audio_track_lang") {
        s.download.audio_track_lang = legacy_audio_track(v);
    }
    if let Some(v) = raw.get("audio_only").and_then(Value::as_bool) {
        s.download.audio_only = v;
    }
    if let Some(label) = str_field(raw, "audio_label") {
        s.download.audio_format = if label.to_ascii_lowercase().contains("mp3") {
            AudioFormat::Mp3
        } else {
            AudioFormat::M4a
        };
    }

    if let Some(v) = u32_field(raw, "concurrent_fragments") {
        s.network.concurrent_fragments = v;
    }
    if let Some(v) = u32_field(raw, "retries") {
        s.network.retries = v;
    }
    if let Some(v) = u32_field(raw, "fragment_retries") {
        s.network.fragment_retries = v;
    }

    let template = str_field(raw, "file_template").or_else(|| str_field(raw, "output_template"));
    if let Some(v) = template {
        match check_file_template(v) {
            Ok(()) => s.download.file_template = v.trim().to_string(),
            Err(e) => log::warn!("Dropping legacy {:#}", e),
        }
    }
    if let Some(v) = str_field(raw, "merge_output_format") {
        s.download.merge_output_format = v.to_string();
    }

    Ok(s)
}

fn str_field<'v>(raw: &'v Map<String, Value>, key: &str) -> Option<&'v str> {
    raw.get(key).and_then(Value::as_str)
}

fn u32_field(raw: &Map<String, Value>, key: &str) -> Option<u32> {
    raw.get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}

/// Accepts a kbps number, a numeric string, or a preset label.
fn legacy_bitrate(v: &Value) -> Option<u32> {
    let kbps: i64 = match v {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => {
            let s = s.trim();
            match BITRATE_PRESETS.iter().find(|(label, _)| *label == s) {
                Some((_, kbps)) => return *kbps,
                None => s.parse().ok()?,
            }
        }
        _ => return None,
    };
    u32::try_from(kbps).ok().filter(|k| *k > 0)
}

/// Accepts a code or a label; anything else falls back to `default`.
fn legacy_audio_track(v: &str) -> String {
    let v = v.trim();
    AUDIO_TRACK_LANGS
        .iter()
        .find(|(label, code)| *label == v || *code == v)
        .map(|(_, code)| code.to_string())
        .unwrap_or_else(default_audio_track_lang)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use serde_json::json;

    #[test]
    fn run_overrides_do_not_touch_saved_values() {
        let saved = UserSettings::default();
        let run = RunOverrides {
            audio_only: true,
            out_dir: Some(PathBuf::from("/tmp/vods")),
            subtitles: Some(" EN, de ,".into()),
            max_height: Some(720),
        }
        .apply(&saved);

        assert!(run.download.audio_only);
        assert_eq!(run.download.out_dir, PathBuf::from("/tmp/vods"));
        assert!(run.subtitles.enabled);
        assert_eq!(run.subtitles.languages, vec!["en", "de"]);
        assert_eq!(run.download.max_height, Some(720));
        assert!(!saved.download.audio_only);

        let unlimited = RunOverrides {
            max_height: Some(0),
            subtitles: Some(String::new()),
            ..RunOverrides::default()
        }
        .apply(&run);
        assert_eq!(unlimited.download.max_height, None);
        assert!(!unlimited.subtitles.enabled);
    }

    #[test]
    fn test_default_settings() {
        let settings = UserSettings::default();
        assert_eq!(settings.download.concurrency, 2);
        assert_eq!(settings.download.merge_output_format, "mp4");
        assert_eq!(settings.subtitles.languages, vec!["hu", "en"]);
        assert_eq!(settings.network.concurrent_fragments, 4);
        assert!(settings.updates.manifest_url.is_none());
    }

    #[test]
    fn test_settings_roundtrip() {
        let db = Db::open_in_memory().unwrap();
        let manager = SettingsManager::new(db.conn());

        let mut settings = UserSettings::default();
        settings.download.concurrency = 4;
        settings.download.out_dir = PathBuf::from("/custom/path");

        manager.save_user_settings(&settings).unwrap();
        let loaded = manager.get_user_settings().unwrap();

        assert_eq!(loaded.download.concurrency, 4);
        assert_eq!(loaded.download.out_dir, PathBuf::from("/custom/path"));
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let s: UserSettings = serde_json::from_str(r#"{"download": {"audio_only": true}}"#).unwrap();
        assert!(s.download.audio_only);
        assert_eq!(s.download.title_max_bytes, 120);
        assert_eq!(s.network.retries, 10);
    }

    #[test]
    fn set_path_edits_one_value() {
        let db = Db::open_in_memory().unwrap();
        let manager = SettingsManager::new(db.conn());

        manager.set_path("download.concurrency", "3").unwrap();
        manager.set_path("subtitles.languages", r#"["en","de"]"#).unwrap();
        manager.set_path("download.audio_format", "mp3").unwrap();
        manager.set_path("download.after", "2024-05-01").unwrap();

        let s = manager.get_user_settings().unwrap();
        assert_eq!(s.download.concurrency, 3);
        assert_eq!(s.subtitles.languages, vec!["en", "de"]);
        assert_eq!(s.download.audio_format, AudioFormat::Mp3);
        assert_eq!(s.download.after.as_deref(), Some("2024-05-01"));

        let s = manager.set_path("download.after", "20240309").unwrap();
        assert_eq!(s.download.after.as_deref(), Some("20240309"));
        let s = manager.set_path("download.max_height", "null").unwrap();
        assert_eq!(s.download.max_height, None);
    }

    #[test]
    fn set_path_rejects_bad_input() {
        let s = UserSettings::default();
        assert!(apply_path(&s, "download.nope", "1").is_err());
        assert!(apply_path(&s, "nope.concurrency", "1").is_err());
        assert!(apply_path(&s, "download.concurrency", "many").is_err());
        assert!(apply_path(&s, "download.after", "yesterday").is_err());
        assert!(apply_path(&s, "", "1").is_err());
    }

    #[test]
    fn file_template_must_name_files_by_id() {
        let s = UserSettings::default();
        assert!(apply_path(&s, "download.file_template", "%(title)s.%(ext)s").is_err());
        assert!(apply_path(&s, "download.file_template", "%(id)s/%(title)s.%(ext)s").is_err());
        let ok = apply_path(&s, "download.file_template", "%(id)s.%(format_id)s.%(ext)s").unwrap();
        assert_eq!(ok.download.file_template, "%(id)s.%(format_id)s.%(ext)s");
        assert_eq!(ok.download.media_template(), "%(id)s.%(format_id)s.%(ext)s");

        // A stored value from before the check falls back to the default.
        let mut stored = UserSettings::default();
        stored.download.file_template = "%(title)s.%(ext)s".to_string();
        assert_eq!(stored.download.media_template(), "%(id)s.%(ext)s");
    }

    #[test]
    fn after_date_formats() {
        assert_eq!(parse_after_date("2024-03-09").unwrap().as_deref(), Some("20240309"));
        assert_eq!(parse_after_date("20240309").unwrap().as_deref(), Some("20240309"));
        assert_eq!(parse_after_date("  ").unwrap(), None);
        assert!(parse_after_date("03/09/2024").is_err());
    }

    #[test]
    fn legacy_config_is_migrated() {
        let raw = json!({
            "out_dir": "D:/Videos",
            "output_template": "%(title)s.%(ext)s",
            "quality_label": "Up to 1440p",
            "audio_label": "Csak hang (mp3 – ffmpeg kell)",
            "audio_track_lang": "German",
            "max_video_bitrate_kbps": "8 Mbps",
            "subs": true,
            "subs_langs": ["en", "sk"],
            "retries": 3,
            "some_removed_option": 42
        });
        let s = import_legacy_config(&raw).unwrap();

        assert_eq!(s.download.out_dir, PathBuf::from("D:/Videos"));
        assert_eq!(s.download.file_template, "%(id)s.%(ext)s");
        assert_eq!(s.download.max_height, Some(1440));
        assert_eq!(s.download.audio_format, AudioFormat::Mp3);
        assert_eq!(s.download.audio_track_lang, "de");
        assert_eq!(s.download.max_video_bitrate_kbps, Some(8000));
        assert!(s.subtitles.enabled);
        assert_eq!(s.subtitles.languages, vec!["en", "sk"]);
        assert_eq!(s.network.retries, 3);
        assert_eq!(s.network.fragment_retries, 10);
    }

    #[test]
    fn legacy_values_are_sanitized() {
        let raw = json!({
            "file_template": "%(id)s.%(ext)s",
            "output_template": "ignored",
            "audio_track_lang": "Klingon",
            "max_video_bitrate_kbps": -5,
            "subs_langs": "en"
        });
        let s = import_legacy_config(&raw).unwrap();
        assert_eq!(s.download.file_template, "%(id)s.%(ext)s");
        assert_eq!(s.download.audio_track_lang, "default");
        assert_eq!(s.download.max_video_bitrate_kbps, None);
        assert_eq!(s.subtitles.languages, vec!["hu", "en"]);

        assert!(import_legacy_config(&json!([1, 2])).is_err());
    }

    #[test]
    fn import_legacy_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vod_downloader.config.json");
        fs::write(&path, r#"{"audio_only": true, "concurrent_fragments": 8}"#).unwrap();

        let db = Db::open_in_memory().unwrap();
        let manager = SettingsManager::new(db.conn());
        manager.import_legacy(&path).unwrap();

        let s = manager.get_user_settings().unwrap();
        assert!(s.download.audio_only);
        assert_eq!(s.network.concurrent_fragments, 8);
    }

    #[test]
    fn relative_out_dir_resolves_under_root() {
        let s = DownloadSettings::default();
        assert_eq!(
            s.resolved_out_dir(Path::new("/root/VODDownloader")),
            PathBuf::from("/root/VODDownloader/downloads")
        );
    }
}
