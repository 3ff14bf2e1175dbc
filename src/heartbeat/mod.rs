//! The heartbeat: a timer-driven pass over the task file.
//!
//! One cycle: active-hours check, non-blocking lock acquisition, parse the task file,
//! run due tasks sequentially (each under a timeout), mark successes in one atomic
//! rewrite, log the cycle and each failure, append to today's daily log, and run an
//! incremental reindex. A busy workspace or a quiet hour skips the cycle without
//! touching anything. The lock guard is dropped on every exit path.

pub mod runner;
pub mod tasks;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::HeartbeatConfig;
use crate::db::Db;
use crate::error::CairnError;
use crate::index::Indexer;
use crate::workspace::lock::{Actor, WorkspaceGuard};
use crate::workspace::{atomic_write, Workspace, TASK_FILE};
pub use tasks::{HeartbeatTask, Schedule, TaskFile};

/// Executes one heartbeat task. Returns a one-line summary for the daily log.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &HeartbeatTask, guard: &WorkspaceGuard) -> Result<String>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    OutsideActiveHours,
    LockHeld { holder: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub task_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub started_at: String,
    pub ran: bool,
    pub tasks_executed: usize,
    pub tasks_failed: usize,
    pub ack_only: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<TaskFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
}

impl CycleReport {
    fn new(cycle_id: &str, now: DateTime<Local>) -> Self {
        Self {
            cycle_id: cycle_id.to_string(),
            started_at: now.to_rfc3339(),
            ran: false,
            tasks_executed: 0,
            tasks_failed: 0,
            ack_only: false,
            failures: Vec::new(),
            skipped: None,
        }
    }
}

/// Per-task view for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub id: String,
    pub description: String,
    pub schedule: Schedule,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<String>,
    pub due_now: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatStatus {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub active_now: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_holder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle: Option<CycleReport>,
    pub tasks: Vec<TaskStatus>,
}

pub struct Heartbeat {
    workspace: Workspace,
    indexer: Indexer,
    db: Db,
    config: HeartbeatConfig,
    runner: Arc<dyn TaskRunner>,
    last: Mutex<Option<CycleReport>>,
}

impl Heartbeat {
    pub fn new(
        workspace: Workspace,
        indexer: Indexer,
        db: Db,
        config: HeartbeatConfig,
        runner: Arc<dyn TaskRunner>,
    ) -> Self {
        Self {
            workspace,
            indexer,
            db,
            config,
            runner,
            last: Mutex::new(None),
        }
    }

    /// Run one cycle now, outside the timer.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.run_cycle_at(Local::now()).await
    }

    /// Run one cycle as if the wall clock read `now`.
    pub async fn run_cycle_at(&self, now: DateTime<Local>) -> Result<CycleReport> {
        let cycle_id = uuid::Uuid::now_v7().to_string();
        let mut report = CycleReport::new(&cycle_id, now);

        if !self.config.is_active_at(now.time()) {
            debug!(cycle_id = %cycle_id, "outside active hours, skipping heartbeat cycle");
            report.skipped = Some(SkipReason::OutsideActiveHours);
            return Ok(self.remember(report));
        }

        let guard = match self.workspace.try_acquire(Actor::Heartbeat, cycle_id.as_str()) {
            Ok(guard) => guard,
            Err(CairnError::LockContention { holder }) => {
                info!(cycle_id = %cycle_id, holder = %holder, "workspace busy, skipping heartbeat cycle");
                report.skipped = Some(SkipReason::LockHeld { holder });
                return Ok(self.remember(report));
            }
            Err(e) => return Err(e.into()),
        };
        report.ran = true;

        let text = self.workspace.read_optional(TASK_FILE)?.unwrap_or_default();
        let due = TaskFile::parse(&text).due(now);

        if due.is_empty() {
            report.ack_only = true;
            self.log(&cycle_id, None, "ack", serde_json::json!({})).await?;
            debug!(cycle_id = %cycle_id, "heartbeat ok, nothing due");
            return Ok(self.remember(report));
        }

        let timeout = self.config.task_timeout();
        let mut succeeded: Vec<(HeartbeatTask, String)> = Vec::new();
        for task in due {
            let outcome = match tokio::time::timeout(timeout, self.runner.run(&task, &guard)).await {
                Ok(Ok(summary)) => Ok(summary),
                Ok(Err(e)) => Err(format!("{e:#}")),
                Err(_) => Err(CairnError::Timeout {
                    step: format!("task {}", task.id),
                    after: timeout,
                }
                .to_string()),
            };
            match outcome {
                Ok(summary) => {
                    debug!(task_id = %task.id, "heartbeat task done");
                    report.tasks_executed += 1;
                    succeeded.push((task, summary));
                }
                Err(error) => {
                    warn!(task_id = %task.id, error = %error, "heartbeat task failed");
                    self.log(
                        &cycle_id,
                        Some(&task.id),
                        "failed",
                        serde_json::json!({"error": error}),
                    )
                    .await?;
                    report.tasks_failed += 1;
                    report.failures.push(TaskFailure {
                        task_id: task.id,
                        error,
                    });
                }
            }
        }

        if !succeeded.is_empty() {
            // Tasks may have written to the workspace; mark against the current file.
            let current = self.workspace.read_optional(TASK_FILE)?.unwrap_or_default();
            let mut file = TaskFile::parse(&current);
            for (task, _) in &succeeded {
                if !file.mark_done(&task.id, now) {
                    warn!(task_id = %task.id, "task vanished from the task file before it could be marked");
                }
            }
            atomic_write(&self.workspace.task_file(), &file.render())?;
        }

        self.log(
            &cycle_id,
            None,
            "executed",
            serde_json::json!({"executed": report.tasks_executed, "failed": report.tasks_failed}),
        )
        .await?;
        self.workspace.append_daily_log(
            &guard,
            now.date_naive(),
            &daily_entry(now, &succeeded, &report.failures),
        )?;

        if let Err(e) = self.indexer.reindex_all().await {
            warn!(error = %e, "post-cycle reindex failed");
        }
        drop(guard);

        info!(
            cycle_id = %cycle_id,
            executed = report.tasks_executed,
            failed = report.tasks_failed,
            "heartbeat cycle complete"
        );
        Ok(self.remember(report))
    }

    /// The report of the most recent cycle, if any has run.
    pub fn last_status(&self) -> Option<CycleReport> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Last cycle plus a per-task view of the task file.
    pub fn status(&self) -> Result<HeartbeatStatus> {
        let now = Local::now();
        let text = self.workspace.read_optional(TASK_FILE)?.unwrap_or_default();
        let tasks = TaskFile::parse(&text)
            .tasks()
            .iter()
            .map(|t| TaskStatus {
                id: t.id.clone(),
                description: t.description.clone(),
                schedule: t.schedule.clone(),
                done: t.done,
                last_run_at: t.last_run_at.map(|d| d.to_rfc3339()),
                due_now: t.schedule.is_due(t.last_run_at, now),
            })
            .collect();
        Ok(HeartbeatStatus {
            enabled: self.config.enabled,
            interval_minutes: self.config.interval_minutes,
            active_now: self.config.is_active_at(now.time()),
            lock_holder: self.workspace.lock().holder().map(|h| h.to_string()),
            last_cycle: self.last_status(),
            tasks,
        })
    }

    /// Start the interval timer. The first cycle runs one interval after start.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.interval();
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_minutes = self.config.interval_minutes, "heartbeat started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_cycle().await {
                            error!(error = %e, "heartbeat cycle failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("heartbeat stopped");
                        break;
                    }
                }
            }
        })
    }

    fn remember(&self, report: CycleReport) -> CycleReport {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        report
    }

    async fn log(
        &self,
        cycle_id: &str,
        task_id: Option<&str>,
        outcome: &'static str,
        details: serde_json::Value,
    ) -> Result<()> {
        let db = self.db.clone();
        let cycle_id = cycle_id.to_string();
        let task_id = task_id.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            let conn = crate::db::lock(&db)?;
            write_heartbeat_log(&conn, &cycle_id, task_id.as_deref(), outcome, &details)
        })
        .await
        .map_err(|e| anyhow::anyhow!("heartbeat log task failed: {e}"))?
    }
}

/// Write an entry to the heartbeat_log audit table.
fn write_heartbeat_log(
    conn: &rusqlite::Connection,
    cycle_id: &str,
    task_id: Option<&str>,
    outcome: &str,
    details: &serde_json::Value,
) -> Result<()> {
    conn.execute(
        "INSERT INTO heartbeat_log (cycle_id, task_id, outcome, details, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            cycle_id,
            task_id,
            outcome,
            details.to_string(),
            chrono::Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

fn daily_entry(
    now: DateTime<Local>,
    succeeded: &[(HeartbeatTask, String)],
    failures: &[TaskFailure],
) -> String {
    let mut entry = format!("## Heartbeat {}\n", now.format("%H:%M"));
    for (task, summary) in succeeded {
        let summary = summary.lines().next().unwrap_or("").trim();
        if summary.is_empty() {
            entry.push_str(&format!("- [x] {}\n", task.description));
        } else {
            entry.push_str(&format!("- [x] {}: {summary}\n", task.description));
        }
    }
    for failure in failures {
        entry.push_str(&format!("- [ ] {} failed: {}\n", failure.task_id, failure.error));
    }
    entry
}
