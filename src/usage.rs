//! Gate between running download jobs and the tool updater.
//!
//! Jobs hold a [`ToolLease`] on every tool they may spawn for as long as they
//! run. The updater takes an [`UpdateGuard`] per tool, which waits until the
//! tool's lease count is zero and then keeps new leases out until the file
//! has been replaced.
//!
//! Within one process this is a counter. Across processes (`download` and
//! `update-tools` are separate invocations) each tool also has an advisory
//! lock file: leases hold it shared, the updater holds it exclusively.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fs2::FileExt;
use tokio::sync::Notify;

use crate::error::LifecycleError;
use crate::tools::Tool;

/// How often a contended lock file is retried.
const LOCK_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

fn lock_path(dir: &Path, tool: Tool) -> PathBuf {
    dir.join(format!("{}.lock", tool.as_str()))
}

fn open_lock(dir: &Path, tool: Tool) -> io::Result<File> {
    fs::create_dir_all(dir)?;
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path(dir, tool))
}

fn try_lock(file: &File, mode: LockMode) -> io::Result<bool> {
    let locked = match mode {
        LockMode::Shared => FileExt::try_lock_shared(file),
        LockMode::Exclusive => FileExt::try_lock_exclusive(file),
    };
    match locked {
        Ok(()) => Ok(true),
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Poll until the lock is taken. Contention is waited out; other I/O errors
/// come back to the caller.
async fn hold_lock(dir: &Path, tool: Tool, mode: LockMode) -> io::Result<File> {
    let file = open_lock(dir, tool)?;
    let mut announced = false;
    while !try_lock(&file, mode)? {
        if !announced {
            announced = true;
            match mode {
                LockMode::Shared => {
                    log::info!("{} is being updated by another process; waiting", tool)
                }
                LockMode::Exclusive => {
                    log::info!("{} is in use by another process; waiting", tool)
                }
            }
        }
        tokio::time::sleep(LOCK_POLL).await;
    }
    Ok(file)
}

#[derive(Default)]
struct State {
    in_use: HashMap<Tool, usize>,
    updating: HashSet<Tool>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    changed: Notify,
    /// Directory of per-tool lock files shared with other processes.
    lock_dir: Option<PathBuf>,
}

#[derive(Clone, Default)]
pub struct ToolUsage {
    inner: Arc<Inner>,
}

impl ToolUsage {
    /// Gate for this process only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate that also coordinates with other processes through lock files
    /// in `lock_dir` (normally `<root>/state/locks`).
    pub fn shared(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                lock_dir: Some(lock_dir.into()),
                ..Inner::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of live leases on `tool`.
    pub fn in_use(&self, tool: Tool) -> usize {
        self.state().in_use.get(&tool).copied().unwrap_or(0)
    }

    pub fn is_updating(&self, tool: Tool) -> bool {
        self.state().updating.contains(&tool)
    }

    /// Lease all `tools` at once, waiting while any of them is being replaced
    /// here or in another process.
    pub async fn acquire(&self, tools: &[Tool]) -> ToolLease {
        let mut lease = self.acquire_local(tools).await;
        if let Some(dir) = &self.inner.lock_dir {
            for &tool in tools {
                match hold_lock(dir, tool, LockMode::Shared).await {
                    Ok(file) => lease.files.push(file),
                    Err(e) => log::warn!(
                        "Could not lock {} in {}: {}; other processes will not see this job",
                        tool,
                        dir.display(),
                        e
                    ),
                }
            }
        }
        lease
    }

    async fn acquire_local(&self, tools: &[Tool]) -> ToolLease {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if !tools.iter().any(|t| state.updating.contains(t)) {
                    for &t in tools {
                        *state.in_use.entry(t).or_insert(0) += 1;
                    }
                    return ToolLease {
                        usage: self.clone(),
                        tools: tools.to_vec(),
                        files: Vec::new(),
                    };
                }
            }

            log::info!("Waiting for a tool update to finish before starting job");
            notified.await;
        }
    }

    /// Wait (at most `wait`) for `tool` to go idle, then block new leases
    /// until the returned guard is dropped.
    pub async fn begin_update(
        &self,
        tool: Tool,
        wait: Duration,
    ) -> Result<UpdateGuard, LifecycleError> {
        let attempt = async {
            let mut guard = self.wait_idle_and_mark(tool).await;
            if let Some(dir) = &self.inner.lock_dir {
                let file = hold_lock(dir, tool, LockMode::Exclusive)
                    .await
                    .map_err(|e| LifecycleError::ToolUpdateFailed {
                        tool,
                        reason: format!("cannot lock {}: {e}", lock_path(dir, tool).display()),
                    })?;
                guard.file = Some(file);
            }
            Ok::<_, LifecycleError>(guard)
        };

        match tokio::time::timeout(wait, attempt).await {
            Ok(result) => result,
            // A zero local count means the holder is another process.
            Err(_) => Err(LifecycleError::ToolInUse {
                tool,
                in_use: self.in_use(tool).max(1),
            }),
        }
    }

    async fn wait_idle_and_mark(&self, tool: Tool) -> UpdateGuard {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                let busy = state.in_use.get(&tool).copied().unwrap_or(0) > 0;
                if !busy && !state.updating.contains(&tool) {
                    state.updating.insert(tool);
                    return UpdateGuard {
                        usage: self.clone(),
                        tool,
                        file: None,
                    };
                }
            }

            notified.await;
        }
    }
}

/// Released on drop. Closing the lock files releases their locks.
pub struct ToolLease {
    usage: ToolUsage,
    tools: Vec<Tool>,
    files: Vec<File>,
}

impl ToolLease {
    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }
}

impl Drop for ToolLease {
    fn drop(&mut self) {
        for file in &self.files {
            let _ = FileExt::unlock(file);
        }
        {
            let mut state = self.usage.state();
            for t in &self.tools {
                if let Some(n) = state.in_use.get_mut(t) {
                    *n = n.saturating_sub(1);
                    if *n == 0 {
                        state.in_use.remove(t);
                    }
                }
            }
        }
        self.usage.inner.changed.notify_waiters();
    }
}

/// Released on drop.
pub struct UpdateGuard {
    usage: ToolUsage,
    tool: Tool,
    file: Option<File>,
}

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = FileExt::unlock(file);
        }
        self.usage.state().updating.remove(&self.tool);
        self.usage.inner.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn leases_are_counted_and_released() {
        let usage = ToolUsage::new();
        let a = usage.acquire(&[Tool::YtDlp, Tool::Ffmpeg]).await;
        let b = usage.acquire(&[Tool::YtDlp]).await;
        assert_eq!(usage.in_use(Tool::YtDlp), 2);
        assert_eq!(usage.in_use(Tool::Ffmpeg), 1);
        assert_eq!(a.tools(), &[Tool::YtDlp, Tool::Ffmpeg]);
        drop(a);
        assert_eq!(usage.in_use(Tool::Ffmpeg), 0);
        drop(b);
        assert_eq!(usage.in_use(Tool::YtDlp), 0);
    }

    #[tokio::test]
    async fn update_refused_while_in_use() {
        let usage = ToolUsage::new();
        let _lease = usage.acquire(&[Tool::YtDlp]).await;

        let err = usage
            .begin_update(Tool::YtDlp, Duration::from_millis(20))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LifecycleError::ToolInUse { tool: Tool::YtDlp, in_use: 1 }));

        // Other tools are unaffected.
        assert!(usage.begin_update(Tool::Deno, Duration::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn update_waits_for_running_job() {
        let usage = ToolUsage::new();
        let lease = usage.acquire(&[Tool::Ffmpeg]).await;

        let waiter = {
            let usage = usage.clone();
            tokio::spawn(async move {
                usage
                    .begin_update(Tool::Ffmpeg, Duration::from_secs(5))
                    .await
                    .is_ok()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!usage.is_updating(Tool::Ffmpeg));
        drop(lease);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn jobs_wait_for_replacement_to_finish() {
        let usage = ToolUsage::new();
        let guard = usage
            .begin_update(Tool::YtDlp, Duration::ZERO)
            .await
            .ok()
            .unwrap();
        assert!(usage.is_updating(Tool::YtDlp));

        let job = {
            let usage = usage.clone();
            tokio::spawn(async move {
                let lease = usage.acquire(&[Tool::YtDlp]).await;
                lease.tools().len()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!job.is_finished());
        drop(guard);

        assert_eq!(job.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn separate_gates_over_one_lock_dir_see_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = ToolUsage::shared(dir.path());
        let updater = ToolUsage::shared(dir.path());

        let lease = downloader.acquire(&[Tool::YtDlp]).await;
        let err = updater
            .begin_update(Tool::YtDlp, Duration::from_millis(500))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LifecycleError::ToolInUse { tool: Tool::YtDlp, .. }));
        assert!(!updater.is_updating(Tool::YtDlp));

        // Shared leases do not block each other.
        let second = ToolUsage::shared(dir.path()).acquire(&[Tool::YtDlp]).await;
        drop(second);
        drop(lease);

        let guard = updater
            .begin_update(Tool::YtDlp, Duration::from_secs(5))
            .await
            .ok()
            .unwrap();
        assert!(dir.path().join("yt-dlp.lock").exists());

        let job = {
            let downloader = downloader.clone();
            tokio::spawn(async move { downloader.acquire(&[Tool::YtDlp]).await.tools().len() })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!job.is_finished());

        drop(guard);
        assert_eq!(job.await.unwrap(), 1);
    }
}
