use anyhow::Result;

use crate::config::CairnConfig;
use crate::daemon::Daemon;

/// Run one heartbeat cycle now and print the report.
pub async fn run(config: CairnConfig) -> Result<()> {
    let daemon = Daemon::open(config).await?;
    let report = daemon.heartbeat().run_cycle().await?;

    if let Some(reason) = &report.skipped {
        println!("Skipped: {}", serde_json::to_string(reason)?);
    } else if report.ack_only {
        println!("Nothing due. HEARTBEAT_OK");
    } else {
        println!(
            "Executed {} task(s), {} failed.",
            report.tasks_executed, report.tasks_failed
        );
        for failure in &report.failures {
            println!("  FAILED {}: {}", failure.task_id, failure.error);
        }
    }

    daemon.shutdown().await;
    Ok(())
}

/// Print the task list with due flags.
pub async fn status(config: CairnConfig) -> Result<()> {
    let daemon = Daemon::open(config).await?;
    let status = daemon.heartbeat().status()?;

    println!(
        "Heartbeat: {} (every {} min, {})",
        if status.enabled { "enabled" } else { "disabled" },
        status.interval_minutes,
        if status.active_now {
            "inside active hours"
        } else {
            "outside active hours"
        }
    );
    println!();
    if status.tasks.is_empty() {
        println!("No tasks in {}.", crate::workspace::TASK_FILE);
    }
    for task in &status.tasks {
        println!(
            "  [{}] {:<40} {}{}",
            if task.done { "x" } else { " " },
            task.id,
            if task.due_now { "due" } else { "not due" },
            task.last_run_at
                .as_deref()
                .map(|t| format!(", last run {t}"))
                .unwrap_or_default()
        );
    }

    daemon.shutdown().await;
    Ok(())
}
