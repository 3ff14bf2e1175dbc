mod helpers;

use std::sync::Arc;

use cairn::heartbeat::{SkipReason, TaskRunner};
use cairn::workspace::lock::Actor;
use chrono::{DateTime, Local, TimeZone};
use helpers::ScriptedRunner;

const CHORES: &str = "# HEARTBEAT.md\n\n## Chores (daily)\n- [ ] Water the ferns\n- [ ] Clean the gutters\n- [ ] Feed the cat\n";

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
    Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

async fn daemon_with(runner: &Arc<ScriptedRunner>) -> helpers::TestDaemon {
    let r: Arc<dyn TaskRunner> = runner.clone();
    helpers::test_daemon(Some(r)).await
}

#[tokio::test]
async fn cycle_skips_without_side_effects_while_a_session_holds_the_lock() {
    let runner = Arc::new(ScriptedRunner::default());
    let t = daemon_with(&runner).await;
    t.write("HEARTBEAT.md", CHORES);
    let before = t.read("HEARTBEAT.md");

    let _session = t
        .daemon
        .workspace()
        .acquire(Actor::Session, "s1")
        .await
        .unwrap();

    for minute in [0, 30] {
        let report = t
            .daemon
            .heartbeat()
            .run_cycle_at(at(2026, 3, 10, 9, minute))
            .await
            .unwrap();
        assert!(!report.ran);
        match report.skipped {
            Some(SkipReason::LockHeld { holder }) => assert!(holder.contains("session:s1")),
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    assert_eq!(t.read("HEARTBEAT.md"), before, "task file must be byte-identical");
    assert_eq!(t.count("SELECT COUNT(*) FROM heartbeat_log"), 0);
    assert!(runner.ran().is_empty());
    let log = t
        .daemon
        .workspace()
        .daily_log_path(at(2026, 3, 10, 9, 0).date_naive());
    assert!(!log.exists());
}

#[tokio::test]
async fn daily_task_runs_once_per_day_even_when_checked() {
    let runner = Arc::new(ScriptedRunner::default());
    let t = daemon_with(&runner).await;
    t.write("HEARTBEAT.md", "## Plants (daily)\n- [ ] Water the ferns\n");
    let heartbeat = t.daemon.heartbeat();

    let first = heartbeat.run_cycle_at(at(2026, 3, 10, 9, 0)).await.unwrap();
    assert!(first.ran);
    assert_eq!(first.tasks_executed, 1);
    let file = t.read("HEARTBEAT.md");
    assert!(file.contains("- [x] Water the ferns <!-- last_run:"));
    assert!(file.starts_with("## Plants (daily)\n"));

    let later = heartbeat.run_cycle_at(at(2026, 3, 10, 15, 0)).await.unwrap();
    assert!(later.ran);
    assert!(later.ack_only);
    assert_eq!(later.tasks_executed, 0);
    assert_eq!(runner.ran().len(), 1);

    let next_day = heartbeat.run_cycle_at(at(2026, 3, 11, 9, 0)).await.unwrap();
    assert_eq!(next_day.tasks_executed, 1, "the checkbox does not stop a new occurrence");
    assert_eq!(runner.ran(), vec!["plants/water-the-ferns", "plants/water-the-ferns"]);

    assert_eq!(
        t.count("SELECT COUNT(*) FROM heartbeat_log WHERE outcome = 'ack'"),
        1
    );
    assert_eq!(
        t.count("SELECT COUNT(*) FROM heartbeat_log WHERE outcome = 'executed'"),
        2
    );

    let log = std::fs::read_to_string(
        t.daemon
            .workspace()
            .daily_log_path(at(2026, 3, 10, 9, 0).date_naive()),
    )
    .unwrap();
    assert!(log.contains("## Heartbeat 09:00"));
    assert!(log.contains("- [x] Water the ferns"));
    assert!(!log.contains("15:00"), "ack-only cycles do not write to the daily log");
}

#[tokio::test]
async fn failing_task_stays_unchecked_while_the_rest_complete() {
    let runner = Arc::new(ScriptedRunner::failing_on("gutters"));
    let t = daemon_with(&runner).await;
    t.write("HEARTBEAT.md", CHORES);

    let report = t
        .daemon
        .heartbeat()
        .run_cycle_at(at(2026, 3, 10, 9, 0))
        .await
        .unwrap();

    assert!(report.ran);
    assert_eq!(report.tasks_executed, 2);
    assert_eq!(report.tasks_failed, 1);
    assert_eq!(report.failures[0].task_id, "chores/clean-the-gutters");
    assert_eq!(runner.ran().len(), 3, "a failure does not stop later tasks");

    let file = t.read("HEARTBEAT.md");
    let lines: Vec<&str> = file.lines().collect();
    assert!(lines[3].starts_with("- [x] Water the ferns <!-- last_run:"));
    assert_eq!(lines[4], "- [ ] Clean the gutters");
    assert!(lines[5].starts_with("- [x] Feed the cat <!-- last_run:"));

    assert_eq!(
        t.count("SELECT COUNT(*) FROM heartbeat_log WHERE outcome = 'failed'"),
        1
    );
    assert_eq!(
        t.count(
            "SELECT COUNT(*) FROM heartbeat_log WHERE outcome = 'failed' \
             AND task_id = 'chores/clean-the-gutters'"
        ),
        1
    );

    let log = std::fs::read_to_string(
        t.daemon
            .workspace()
            .daily_log_path(at(2026, 3, 10, 9, 0).date_naive()),
    )
    .unwrap();
    assert!(log.contains("chores/clean-the-gutters failed"));

    // The failed task is retried next cycle; the completed ones are not due again today.
    let retry = t
        .daemon
        .heartbeat()
        .run_cycle_at(at(2026, 3, 10, 10, 0))
        .await
        .unwrap();
    assert_eq!(retry.tasks_failed, 1);
    assert_eq!(retry.tasks_executed, 0);
    assert_eq!(runner.ran().len(), 4);
}

#[tokio::test]
async fn outside_active_hours_nothing_runs() {
    let runner = Arc::new(ScriptedRunner::default());
    let r: Arc<dyn TaskRunner> = runner.clone();
    let t = helpers::test_daemon_with(Some(r), |c| {
        c.heartbeat.active_start = "08:00".into();
        c.heartbeat.active_end = "22:00".into();
    })
    .await;
    t.write("HEARTBEAT.md", CHORES);

    let report = t
        .daemon
        .heartbeat()
        .run_cycle_at(at(2026, 3, 10, 23, 15))
        .await
        .unwrap();
    assert!(!report.ran);
    assert!(matches!(report.skipped, Some(SkipReason::OutsideActiveHours)));
    assert!(runner.ran().is_empty());
    assert_eq!(t.count("SELECT COUNT(*) FROM heartbeat_log"), 0);
    assert_eq!(t.daemon.heartbeat().last_status().map(|r| r.ran), Some(false));
}

#[tokio::test]
async fn status_lists_tasks_with_due_flags() {
    let runner = Arc::new(ScriptedRunner::default());
    let t = daemon_with(&runner).await;
    t.write(
        "HEARTBEAT.md",
        "## Always\n- [ ] Check the mailbox\n\n## Plants (daily)\n- [ ] Water the ferns\n",
    );

    let status = t.daemon.heartbeat().status().unwrap();
    assert!(status.last_cycle.is_none());
    assert_eq!(status.tasks.len(), 2);
    assert_eq!(status.tasks[0].id, "always/check-the-mailbox");
    assert!(status.tasks.iter().all(|task| task.due_now && !task.done));
    assert!(status.lock_holder.is_none());
}
