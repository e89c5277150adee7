//! VOD Downloader: per-user installer, vendored tool updater, and a yt-dlp
//! download front-end.

pub mod cli;
pub mod db;
pub mod download_manager;
pub mod error;
pub mod events;
pub mod fetch;
pub mod installer;
pub mod layout;
pub mod naming;
pub mod settings;
pub mod shortcuts;
pub mod tools;
pub mod uninstaller;
pub mod updater;
pub mod url_utils;
pub mod usage;
pub mod ytdlp;

/// Route `log` output to stderr, `info` and above unless `RUST_LOG` says otherwise.
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    let _ = env_logger::Builder::from_env(env)
        .format_target(false)
        .try_init();
}
