//! The on-disk workspace: knowledge files, the task file, daily logs, and fact files.
//!
//! Files are the source of truth. Every mutation goes through [`atomic_write`] and takes
//! a [`WorkspaceGuard`] as proof that the caller holds the workspace lock.

pub mod lock;

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{debug, info};

use crate::error::CairnError;
use lock::{Actor, WorkspaceGuard, WorkspaceLock};

pub const MEMORY_FILE: &str = "MEMORY.md";
pub const SOUL_FILE: &str = "SOUL.md";
pub const TASK_FILE: &str = "HEARTBEAT.md";
pub const LOG_DIR: &str = "memory";
pub const FACTS_DIR: &str = "memory/facts";

#[derive(Clone)]
pub struct Workspace {
    root: PathBuf,
    lock: WorkspaceLock,
    lock_timeout: Duration,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            lock: WorkspaceLock::new(),
            lock_timeout,
        }
    }

    pub fn from_config(config: &crate::config::CairnConfig) -> Self {
        Self::new(
            config.resolved_workspace_root(),
            config.workspace.lock_timeout(),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock(&self) -> &WorkspaceLock {
        &self.lock
    }

    /// Interactive acquisition: waits up to the configured lock timeout.
    pub async fn acquire(
        &self,
        actor: Actor,
        id: impl Into<String>,
    ) -> Result<WorkspaceGuard, CairnError> {
        self.lock.acquire(actor, id, self.lock_timeout).await
    }

    /// Scheduler acquisition: never waits.
    pub fn try_acquire(
        &self,
        actor: Actor,
        id: impl Into<String>,
    ) -> Result<WorkspaceGuard, CairnError> {
        self.lock.try_acquire(actor, id)
    }

    pub fn path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    pub fn task_file(&self) -> PathBuf {
        self.path(TASK_FILE)
    }

    pub fn facts_dir(&self) -> PathBuf {
        self.path(FACTS_DIR)
    }

    /// Workspace-relative path with forward slashes, as stored in the index.
    pub fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    /// Create the directory layout and any missing template files.
    ///
    /// Existing files are never overwritten. Returns `true` for a brand new workspace.
    pub fn init(&self, _guard: &WorkspaceGuard) -> Result<bool> {
        std::fs::create_dir_all(self.path(LOG_DIR))
            .with_context(|| format!("failed to create {}", self.path(LOG_DIR).display()))?;
        std::fs::create_dir_all(self.facts_dir())?;

        let templates = [
            (MEMORY_FILE, MEMORY_TEMPLATE),
            (SOUL_FILE, SOUL_TEMPLATE),
            (TASK_FILE, HEARTBEAT_TEMPLATE),
        ];
        let brand_new = templates.iter().all(|(name, _)| !self.path(name).exists());

        for (name, contents) in templates {
            let path = self.path(name);
            if !path.exists() {
                atomic_write(&path, contents)?;
                info!(path = %path.display(), "created workspace file");
            }
        }
        Ok(brand_new)
    }

    /// Read a workspace file, `None` if it does not exist.
    pub fn read_optional(&self, rel: impl AsRef<Path>) -> Result<Option<String>> {
        let path = self.path(rel);
        match std::fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub fn daily_log_path(&self, date: NaiveDate) -> PathBuf {
        self.path(LOG_DIR)
            .join(format!("{}.md", date.format("%Y-%m-%d")))
    }

    /// The `n` most recent daily logs, newest first.
    pub fn recent_daily_logs(&self, n: usize) -> Result<Vec<(NaiveDate, PathBuf)>> {
        let dir = self.path(LOG_DIR);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("failed to list {}", dir.display())),
        };

        let mut logs = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
                logs.push((date, path));
            }
        }
        logs.sort_by(|a, b| b.0.cmp(&a.0));
        logs.truncate(n);
        Ok(logs)
    }

    /// Append a section to the daily log for `date`, creating the log if needed.
    pub fn append_daily_log(
        &self,
        _guard: &WorkspaceGuard,
        date: NaiveDate,
        section: &str,
    ) -> Result<PathBuf> {
        let path = self.daily_log_path(date);
        let mut contents = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                format!("# {}\n", date.format("%Y-%m-%d"))
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push('\n');
        contents.push_str(section.trim_end());
        contents.push('\n');

        atomic_write(&path, &contents)?;
        debug!(path = %path.display(), "appended to daily log");
        Ok(path)
    }

    /// Every indexable file under the root, sorted for stable ordering.
    pub fn indexable_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if self.root.exists() {
            collect_files(&self.root, &mut files)?;
        }
        files.sort();
        Ok(files)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&path, out)?;
        } else if file_type.is_file() && is_indexable(&path) {
            out.push(path);
        }
    }
    Ok(())
}

/// `*.md` and `*.txt`, excluding hidden files and atomic-write temporaries.
pub fn is_indexable(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(true);
    let ext = path.extension().and_then(|e| e.to_str());
    !hidden && matches!(ext, Some("md") | Some("txt"))
}

/// Write `contents` to a temporary sibling and rename it over `path`.
///
/// Readers observe either the old file or the new one.
pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?
        .to_string_lossy();
    let tmp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::now_v7()));

    let write = || -> std::io::Result<()> {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    };
    if let Err(e) = write() {
        let _ = std::fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("failed to write {}", path.display()));
    }
    Ok(())
}

const MEMORY_TEMPLATE: &str = r#"# MEMORY.md - Long-term Knowledge

Curated facts that should be available in every conversation.

## People

## Places

## Preferences
"#;

const SOUL_TEMPLATE: &str = r#"# SOUL.md - Personality

You are a careful personal assistant backed by a verified memory.

## Core Values

**Never fabricate.** Only state facts that come back from verified memory, and cite
their `[VERIFIED:...]` tags. Say "I don't know" when nothing verified was found.

**Be practical.** Short, actionable answers.

**Remember deliberately.** When the user tells you something worth keeping, store it
as a fact with its source.
"#;

const HEARTBEAT_TEMPLATE: &str = r#"# HEARTBEAT.md - Recurring Tasks

Tasks listed here run during heartbeat cycles. A section heading may carry a schedule
in parentheses: (every 2 hours), (hourly), (daily, 8pm), (weekly, Sunday).
Sections without a schedule run every cycle.

## Inbox Review (every 2 hours)
- [ ] Review memory/inbox.md and note anything that needs attention in today's log

## Daily Summary (daily, 8pm)
- [ ] Summarize today's conversations from the daily log

## Weekly Review (weekly, Sunday)
- [ ] Check MEMORY.md for facts that have not been verified recently
"#;
