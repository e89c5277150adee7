use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use uuid::Uuid;

use vod_downloader::cli::{Cli, Commands, SettingsAction};
use vod_downloader::db::{Db, SharedDb};
use vod_downloader::download_manager::DownloadManager;
use vod_downloader::error::LifecycleError;
use vod_downloader::events::AppEvent;
use vod_downloader::fetch::HttpFetcher;
use vod_downloader::installer::Installer;
use vod_downloader::layout::{bundle_dir, EntryPointDirs, InstallLayout};
use vod_downloader::settings::{RunOverrides, SettingsManager, UserSettings};
use vod_downloader::shortcuts::PlatformShortcuts;
use vod_downloader::tools::{probe_version, Tool, ToolDirectory};
use vod_downloader::uninstaller::Uninstaller;
use vod_downloader::updater::ToolUpdater;
use vod_downloader::url_utils::{extract_urls, lines_without_urls};
use vod_downloader::usage::ToolUsage;
use vod_downloader::ytdlp::RunOptions;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();
    vod_downloader::init_logging();

    let code = match cli.command {
        Commands::Install => exit_code(install()),
        Commands::Uninstall => uninstall(),
        Commands::UpdateTools { tools, wait_secs } => {
            exit_code(update_tools(&tools, wait_secs).await)
        }
        Commands::Tools => exit_code(tools_status().await),
        Commands::Download {
            urls,
            dry_run,
            audio_only,
            out,
            subs,
            quality,
        } => {
            let overrides = RunOverrides {
                audio_only,
                out_dir: out,
                subtitles: subs,
                max_height: quality,
            };
            exit_code(download(urls, dry_run, overrides).await)
        }
        Commands::Settings { action } => exit_code(settings(action)),
        Commands::History { limit } => exit_code(history(limit)),
    };

    ExitCode::from(code)
}

/// Typed lifecycle errors carry their own exit code; anything else is 2.
fn exit_code(result: Result<u8>) -> u8 {
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            match e.downcast_ref::<LifecycleError>() {
                Some(le) => u8::try_from(le.exit_code()).unwrap_or(2),
                None => 2,
            }
        }
    }
}

fn install() -> Result<u8> {
    let layout = InstallLayout::resolve()?;
    let entry_points = EntryPointDirs::resolve()?;
    let bundle = bundle_dir()?;
    let shortcuts = PlatformShortcuts;
    let report = Installer::new(bundle, layout, entry_points, &shortcuts).install()?;
    print!("{}", report.summary());
    Ok(0)
}

fn uninstall() -> u8 {
    let targets = InstallLayout::resolve().and_then(|l| Ok((l, EntryPointDirs::resolve()?)));
    match targets {
        Ok((layout, entry_points)) => {
            let report = Uninstaller::new(layout, entry_points).uninstall();
            print!("{}", report.summary());
        }
        Err(e) => log::warn!("Nothing to uninstall: {:#}", e),
    }
    0
}

fn open_db(layout: &InstallLayout) -> Result<SharedDb> {
    let db = Db::open(&layout.db_path())?;
    Ok(Arc::new(Mutex::new(db)))
}

fn load_settings(db: &SharedDb) -> Result<UserSettings> {
    let db = db.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    SettingsManager::new(db.conn()).get_user_settings()
}

async fn update_tools(names: &[String], wait_secs: Option<u64>) -> Result<u8> {
    let selected = names
        .iter()
        .map(|n| n.parse::<Tool>())
        .collect::<Result<Vec<_>>>()?;

    let layout = InstallLayout::resolve()?;
    layout.ensure_runtime_dirs()?;
    let db = open_db(&layout)?;
    let settings = load_settings(&db)?;

    let fetcher = HttpFetcher::new(Duration::from_secs(settings.updates.fetch_timeout_secs))?;
    let wait = Duration::from_secs(wait_secs.unwrap_or(settings.updates.wait_secs));
    let usage = ToolUsage::shared(layout.locks_dir());
    let report = ToolUpdater::new(layout, &fetcher, usage)
        .with_db(db)
        .with_manifest_url(settings.updates.manifest_url.clone())
        .with_wait(wait)
        .update(&selected)
        .await;

    print!("{}", report.summary());
    Ok(if report.is_success() { 0 } else { 2 })
}

async fn tools_status() -> Result<u8> {
    let layout = InstallLayout::resolve()?;
    let db = open_db(&layout)?;
    let tools = ToolDirectory::new(layout.tools_dir());

    println!("Tools in {}", tools.dir().display());
    for info in tools.status() {
        let recorded = {
            let db = db.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            db.tool_record(info.tool)?
        };

        if !info.present {
            let hint = match &info.system_copy {
                Some(p) => format!(" (a system copy exists at {})", p.display()),
                None => String::new(),
            };
            println!("  {:<8} missing{}", info.tool.as_str(), hint);
            continue;
        }

        let version = match probe_version(&info.path, info.tool, Duration::from_secs(15)).await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Could not read {} version: {:#}", info.tool, e);
                "unreadable".to_string()
            }
        };
        let installed = recorded
            .map(|r| format!("updated {} ({})", r.updated_at.format("%Y-%m-%d"), r.version))
            .unwrap_or_else(|| "from bundle".to_string());
        println!(
            "  {:<8} {:<24} {:>12} bytes  {}",
            info.tool.as_str(),
            version,
            info.size_bytes.unwrap_or(0),
            installed
        );
    }
    Ok(0)
}

async fn download(urls: Vec<String>, dry_run: bool, overrides: RunOverrides) -> Result<u8> {
    let text = if urls.is_empty() {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read URLs from stdin")?;
        buf
    } else {
        urls.join("\n")
    };

    for line in lines_without_urls(&text) {
        log::warn!("Ignoring input without an http(s) URL: {}", line);
    }
    let urls = extract_urls(&text);
    if urls.is_empty() {
        eprintln!("error: no http(s) URLs given");
        return Ok(2);
    }

    let layout = InstallLayout::resolve()?;
    layout.ensure_runtime_dirs()?;
    let db = open_db(&layout)?;
    let settings = overrides.apply(&load_settings(&db)?);
    let out_root = settings.download.resolved_out_dir(&layout.root);

    let (event_tx, mut event_rx) = mpsc::channel::<AppEvent>(256);
    let printer = tokio::spawn(async move {
        let mut shown: HashMap<Uuid, i64> = HashMap::new();
        while let Some(event) = event_rx.recv().await {
            // One progress line per 10% step per job.
            if let AppEvent::JobProgress { id, progress } = &event {
                let step = (progress.percent.unwrap_or(0.0) / 10.0).floor() as i64;
                if shown.get(id).is_some_and(|s| *s >= step) {
                    continue;
                }
                shown.insert(*id, step);
            }
            println!("{}", event.describe());
        }
    });

    let manager = DownloadManager::new(
        settings,
        out_root,
        ToolDirectory::new(layout.tools_dir()),
        ToolUsage::shared(layout.locks_dir()),
        db,
        event_tx,
    );
    let result = manager.run(&urls, RunOptions { dry_run }).await;
    drop(manager);
    if let Err(e) = printer.await {
        log::warn!("Event printer stopped: {}", e);
    }

    let summary = result?;
    print!("{}", summary.summary());
    Ok(if summary.is_success() { 0 } else { 2 })
}

fn settings(action: SettingsAction) -> Result<u8> {
    let layout = InstallLayout::resolve()?;
    let db = Db::open(&layout.db_path())?;
    let manager = SettingsManager::new(db.conn());

    let current = match action {
        SettingsAction::Show => manager.get_user_settings()?,
        SettingsAction::Set { key, value } => {
            let updated = manager.set_path(&key, &value)?;
            log::info!("Saved {} = {}", key, value);
            updated
        }
        SettingsAction::ImportLegacy { file } => {
            let imported = manager.import_legacy(&file)?;
            log::info!("Imported settings from {}", file.display());
            imported
        }
    };

    println!("{}", serde_json::to_string_pretty(&current)?);
    Ok(0)
}

fn history(limit: u32) -> Result<u8> {
    let layout = InstallLayout::resolve()?;
    let db = Db::open(&layout.db_path())?;
    let jobs = db.recent_jobs(limit)?;
    if jobs.is_empty() {
        println!("No downloads yet.");
        return Ok(0);
    }

    for job in jobs {
        let label = job
            .title
            .as_deref()
            .or(job.item_id.as_deref())
            .unwrap_or(job.url.as_str());
        println!(
            "{}  {:<8} {}",
            job.created_at.format("%Y-%m-%d %H:%M"),
            job.status.as_str(),
            label
        );
        if let Some(dir) = &job.output_dir {
            println!("                   -> {}", PathBuf::from(dir).display());
        }
        if let (Some(code), Some(msg)) = (&job.error_code, &job.error_message) {
            println!("                   [{code}] {msg}");
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_a_missing_artifact_exits_with_one() {
        let missing = anyhow::Error::new(LifecycleError::MissingBundleArtifact {
            expected: PathBuf::from("bundle/vod-downloader"),
        })
        .context("install");
        assert_eq!(exit_code(Err(missing)), 1);

        let copy_failed = anyhow::anyhow!("copy bundle/tools to root/tools: permission denied");
        assert_eq!(exit_code(Err(copy_failed)), 2);
        assert_eq!(exit_code(Ok(0)), 0);
    }
}
