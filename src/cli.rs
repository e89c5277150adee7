use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "vod-downloader")]
#[command(author, version, about = "Per-user installer, tool updater and downloader front-end for yt-dlp", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Install into the per-user data directory and create shortcuts
    Install,

    /// Remove the installation and its shortcuts
    Uninstall,

    /// Download fresh copies of the vendored tools
    UpdateTools {
        /// Tools to update (yt-dlp, ffmpeg, ffprobe, ffplay, deno); all when omitted
        tools: Vec<String>,

        /// Seconds to wait for running downloads to release a tool
        #[arg(long)]
        wait_secs: Option<u64>,
    },

    /// Show which tools are installed and their versions
    Tools,

    /// Download one or more URLs (read from stdin when none are given)
    Download {
        urls: Vec<String>,

        /// Resolve everything but do not download
        #[arg(long)]
        dry_run: bool,

        /// Download the audio track only
        #[arg(long)]
        audio_only: bool,

        /// Output folder
        #[arg(long)]
        out: Option<PathBuf>,

        /// Comma separated subtitle languages, e.g. `hu,en`
        #[arg(long)]
        subs: Option<String>,

        /// Maximum video height, e.g. 1080; 0 means best available
        #[arg(long)]
        quality: Option<u32>,
    },

    /// Inspect or change saved settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Show recent download jobs
    History {
        /// Number of jobs to list
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Subcommand)]
pub enum SettingsAction {
    /// Print the current settings as JSON
    Show,

    /// Set a value by dotted key, e.g. `download.max_height 1080`
    Set { key: String, value: String },

    /// Import a `vod_downloader.config.json` from the previous release
    ImportLegacy { file: PathBuf },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
