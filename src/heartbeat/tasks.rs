//! The task file: `## Section (schedule)` headings and `- [ ]` / `- [x]` task lines.
//!
//! Each task line may carry a trailing `<!-- last_run: RFC3339 -->` stamp that the
//! scheduler manages. The stamp and the checkbox are independent: due-ness is decided by
//! the schedule and the stamp, and the checkbox is never un-marked automatically.

use chrono::{DateTime, Datelike, Days, Duration, Local, NaiveTime, TimeZone, Weekday};
use serde::Serialize;
use tracing::warn;

use crate::facts::slugify;

const STAMP_PREFIX: &str = "<!-- last_run:";
const STAMP_SUFFIX: &str = "-->";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// No annotation: due every cycle.
    EveryCycle,
    Interval { minutes: i64 },
    Daily { at: Option<NaiveTime> },
    Weekly { on: Option<Weekday> },
}

impl Schedule {
    /// Parse the text inside a heading's trailing parentheses.
    pub fn parse(annotation: &str) -> Option<Self> {
        let a = annotation.trim().to_ascii_lowercase();
        let (head, detail) = match a.split_once(',') {
            Some((h, d)) => (h.trim(), Some(d.trim())),
            None => (a.as_str(), None),
        };

        match head {
            "hourly" | "every hour" => return Some(Self::Interval { minutes: 60 }),
            "daily" | "every day" => {
                let at = match detail {
                    Some(d) => Some(parse_time_of_day(d)?),
                    None => None,
                };
                return Some(Self::Daily { at });
            }
            "weekly" | "every week" => {
                let on = match detail {
                    Some(d) => Some(d.parse::<Weekday>().ok()?),
                    None => None,
                };
                return Some(Self::Weekly { on });
            }
            _ => {}
        }

        let rest = head.strip_prefix("every ")?;
        let (n, unit) = rest.split_once(' ')?;
        let n: i64 = n.trim().parse().ok().filter(|n| *n > 0)?;
        let minutes = match unit.trim() {
            "minute" | "minutes" | "min" | "mins" => n,
            "hour" | "hours" | "hr" | "hrs" => n * 60,
            "day" | "days" => n * 24 * 60,
            _ => return None,
        };
        Some(Self::Interval { minutes })
    }

    /// Whether a task with this schedule is due at `now`, given its last run.
    ///
    /// A task that has never run is always due. Daily and weekly schedules compare
    /// against the most recent scheduled occurrence, so a missed occurrence still runs.
    pub fn is_due(&self, last_run: Option<DateTime<Local>>, now: DateTime<Local>) -> bool {
        let Some(last) = last_run else {
            return true;
        };
        match self {
            Self::EveryCycle => true,
            Self::Interval { minutes } => now - last >= Duration::minutes(*minutes),
            Self::Daily { at: None } => last.date_naive() < now.date_naive(),
            Self::Daily { at: Some(at) } => {
                let today = now.date_naive();
                let occurrence_day = if now.time() >= *at {
                    today
                } else {
                    today - Days::new(1)
                };
                match Local.from_local_datetime(&occurrence_day.and_time(*at)).earliest() {
                    Some(occurrence) => last < occurrence,
                    None => last.date_naive() < today,
                }
            }
            Self::Weekly { on: None } => (now.date_naive() - last.date_naive()).num_days() >= 7,
            Self::Weekly { on: Some(day) } => {
                let today = now.date_naive();
                let back = (7 + today.weekday().num_days_from_monday()
                    - day.num_days_from_monday())
                    % 7;
                let occurrence = today - Days::new(u64::from(back));
                last.date_naive() < occurrence
            }
        }
    }
}

/// `8pm`, `8:30pm`, `8 pm`, `20:00`.
fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    let s = s.trim().trim_start_matches("at ").replace(' ', "");
    let (clock, pm) = if let Some(c) = s.strip_suffix("pm") {
        (c, Some(true))
    } else if let Some(c) = s.strip_suffix("am") {
        (c, Some(false))
    } else {
        (s.as_str(), None)
    };
    let (h, m) = match clock.split_once(':') {
        Some((h, m)) => (h.parse::<u32>().ok()?, m.parse::<u32>().ok()?),
        None => (clock.parse::<u32>().ok()?, 0),
    };
    let hour = match pm {
        Some(true) if h < 12 => h + 12,
        Some(false) if h == 12 => 0,
        Some(_) if h > 12 => return None,
        _ => h,
    };
    NaiveTime::from_hms_opt(hour, m, 0)
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatTask {
    /// `section-slug/description-slug`, unique within the file.
    pub id: String,
    pub section: String,
    pub description: String,
    pub schedule: Schedule,
    pub last_run_at: Option<DateTime<Local>>,
    pub done: bool,
    #[serde(skip)]
    line: usize,
}

/// A parsed task file that can be re-rendered with only task lines changed.
#[derive(Debug, Clone)]
pub struct TaskFile {
    lines: Vec<String>,
    trailing_newline: bool,
    tasks: Vec<HeartbeatTask>,
}

impl TaskFile {
    pub fn parse(text: &str) -> Self {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        let mut tasks: Vec<HeartbeatTask> = Vec::new();
        let mut section = String::from("general");
        let mut schedule = Schedule::EveryCycle;

        for (n, line) in lines.iter().enumerate() {
            let trimmed = line.trim();
            if let Some(heading) = trimmed.strip_prefix('#') {
                let heading = heading.trim_start_matches('#').trim();
                (section, schedule) = parse_heading(heading);
                continue;
            }
            let Some((done, rest)) = parse_checkbox(trimmed) else {
                continue;
            };
            let (description, last_run_at) = split_stamp(rest);
            if description.is_empty() {
                continue;
            }

            let base = format!("{}/{}", slugify(&section), slugify(&description));
            let mut id = base.clone();
            let mut suffix = 2;
            while tasks.iter().any(|t| t.id == id) {
                id = format!("{base}-{suffix}");
                suffix += 1;
            }

            tasks.push(HeartbeatTask {
                id,
                section: section.clone(),
                description,
                schedule: schedule.clone(),
                last_run_at,
                done,
                line: n,
            });
        }

        Self {
            lines,
            trailing_newline: text.ends_with('\n'),
            tasks,
        }
    }

    pub fn tasks(&self) -> &[HeartbeatTask] {
        &self.tasks
    }

    /// Tasks due at `now`, in file order.
    pub fn due(&self, now: DateTime<Local>) -> Vec<HeartbeatTask> {
        self.tasks
            .iter()
            .filter(|t| t.schedule.is_due(t.last_run_at, now))
            .cloned()
            .collect()
    }

    /// Mark a task done and stamp its last run. Returns `false` for an unknown id.
    pub fn mark_done(&mut self, id: &str, at: DateTime<Local>) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) else {
            return false;
        };
        let original = &self.lines[task.line];
        let indent = &original[..original.len() - original.trim_start().len()];
        let bullet = if original.trim_start().starts_with('*') { '*' } else { '-' };
        let rewritten = format!(
            "{indent}{bullet} [x] {} {STAMP_PREFIX} {} {STAMP_SUFFIX}",
            task.description,
            at.to_rfc3339()
        );
        self.lines[task.line] = rewritten;
        task.done = true;
        task.last_run_at = Some(at);
        true
    }

    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.trailing_newline {
            out.push('\n');
        }
        out
    }
}

fn parse_heading(heading: &str) -> (String, Schedule) {
    if let Some(open) = heading.rfind('(') {
        if heading.ends_with(')') {
            let annotation = &heading[open + 1..heading.len() - 1];
            let name = heading[..open].trim().to_string();
            match Schedule::parse(annotation) {
                Some(schedule) => return (name, schedule),
                None => warn!(heading, "unrecognized schedule annotation, running every cycle"),
            }
        }
    }
    (heading.to_string(), Schedule::EveryCycle)
}

fn parse_checkbox(line: &str) -> Option<(bool, &str)> {
    let rest = line.strip_prefix("- ").or_else(|| line.strip_prefix("* "))?;
    if let Some(r) = rest.strip_prefix("[ ]") {
        Some((false, r))
    } else if let Some(r) = rest
        .strip_prefix("[x]")
        .or_else(|| rest.strip_prefix("[X]"))
    {
        Some((true, r))
    } else {
        None
    }
}

fn split_stamp(rest: &str) -> (String, Option<DateTime<Local>>) {
    let Some(pos) = rest.find(STAMP_PREFIX) else {
        return (rest.trim().to_string(), None);
    };
    let description = rest[..pos].trim().to_string();
    let stamp = rest[pos + STAMP_PREFIX.len()..]
        .trim()
        .trim_end_matches(STAMP_SUFFIX)
        .trim();
    let last_run = match DateTime::parse_from_rfc3339(stamp) {
        Ok(t) => Some(t.with_timezone(&Local)),
        Err(e) => {
            warn!(stamp, error = %e, "unparseable last_run stamp, treating task as never run");
            None
        }
    };
    (description, last_run)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn parses_schedule_annotations() {
        assert_eq!(Schedule::parse("every hour"), Some(Schedule::Interval { minutes: 60 }));
        assert_eq!(Schedule::parse("hourly"), Some(Schedule::Interval { minutes: 60 }));
        assert_eq!(Schedule::parse("every 2 hours"), Some(Schedule::Interval { minutes: 120 }));
        assert_eq!(Schedule::parse("every 30 minutes"), Some(Schedule::Interval { minutes: 30 }));
        assert_eq!(
            Schedule::parse("daily, 8pm"),
            Some(Schedule::Daily { at: NaiveTime::from_hms_opt(20, 0, 0) })
        );
        assert_eq!(Schedule::parse("Daily"), Some(Schedule::Daily { at: None }));
        assert_eq!(
            Schedule::parse("weekly, Sunday"),
            Some(Schedule::Weekly { on: Some(Weekday::Sun) })
        );
        assert_eq!(Schedule::parse("whenever"), None);
        assert_eq!(Schedule::parse("every 0 hours"), None);
    }

    #[test]
    fn parses_times_of_day() {
        assert_eq!(parse_time_of_day("8pm"), NaiveTime::from_hms_opt(20, 0, 0));
        assert_eq!(parse_time_of_day("8:30 am"), NaiveTime::from_hms_opt(8, 30, 0));
        assert_eq!(parse_time_of_day("12am"), NaiveTime::from_hms_opt(0, 0, 0));
        assert_eq!(parse_time_of_day("20:15"), NaiveTime::from_hms_opt(20, 15, 0));
        assert_eq!(parse_time_of_day("13pm"), None);
    }

    #[test]
    fn daily_runs_once_per_calendar_day() {
        let daily = Schedule::Daily { at: None };
        let ran = at(2026, 3, 10, 9, 0);
        assert!(!daily.is_due(Some(ran), at(2026, 3, 10, 21, 0)));
        assert!(daily.is_due(Some(ran), at(2026, 3, 11, 7, 0)));
        assert!(daily.is_due(None, at(2026, 3, 10, 21, 0)));
    }

    #[test]
    fn daily_at_time_waits_for_the_time() {
        let daily = Schedule::Daily { at: NaiveTime::from_hms_opt(20, 0, 0) };
        let ran = at(2026, 3, 10, 20, 5);
        assert!(!daily.is_due(Some(ran), at(2026, 3, 10, 23, 0)));
        assert!(!daily.is_due(Some(ran), at(2026, 3, 11, 9, 0)));
        assert!(daily.is_due(Some(ran), at(2026, 3, 11, 20, 0)));
    }

    #[test]
    fn interval_and_weekly_due_logic() {
        let every_two = Schedule::Interval { minutes: 120 };
        let ran = at(2026, 3, 10, 9, 0);
        assert!(!every_two.is_due(Some(ran), at(2026, 3, 10, 10, 59)));
        assert!(every_two.is_due(Some(ran), at(2026, 3, 10, 11, 0)));

        // 2026-03-08 is a Sunday.
        let weekly = Schedule::Weekly { on: Some(Weekday::Sun) };
        let sunday = at(2026, 3, 8, 10, 0);
        assert!(!weekly.is_due(Some(sunday), at(2026, 3, 14, 10, 0)));
        assert!(weekly.is_due(Some(sunday), at(2026, 3, 15, 8, 0)));
        assert!(weekly.is_due(Some(sunday), at(2026, 3, 16, 8, 0)));
    }

    const FILE: &str = "# Tasks\n\n## Calendar Sync (every hour)\n- [ ] Fetch events\n  - [x] Update calendar <!-- last_run: 2026-03-10T09:00:00+00:00 -->\n\n## Chores\n* [ ] Water plants\n";

    #[test]
    fn parses_sections_checkboxes_and_stamps() {
        let file = TaskFile::parse(FILE);
        let tasks = file.tasks();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].id, "calendar-sync/fetch-events");
        assert_eq!(tasks[0].schedule, Schedule::Interval { minutes: 60 });
        assert!(!tasks[0].done);
        assert!(tasks[1].done);
        assert!(tasks[1].last_run_at.is_some());
        assert_eq!(tasks[1].description, "Update calendar");
        assert_eq!(tasks[2].section, "Chores");
        assert_eq!(tasks[2].schedule, Schedule::EveryCycle);
    }

    #[test]
    fn checked_task_without_stamp_is_still_due() {
        let file = TaskFile::parse("## Daily (daily)\n- [x] Already ticked by hand\n");
        assert_eq!(file.due(at(2026, 3, 10, 12, 0)).len(), 1);
    }

    #[test]
    fn mark_done_rewrites_only_that_line() {
        let mut file = TaskFile::parse(FILE);
        let now = at(2026, 3, 10, 12, 0);
        assert!(file.mark_done("chores/water-plants", now));
        assert!(!file.mark_done("nope/missing", now));

        let rendered = file.render();
        assert!(rendered.ends_with('\n'));
        assert!(rendered.contains("* [x] Water plants <!-- last_run: "));
        assert!(rendered.contains("- [ ] Fetch events\n"));

        let reparsed = TaskFile::parse(&rendered);
        let water = &reparsed.tasks()[2];
        assert!(water.done);
        assert_eq!(water.last_run_at, Some(now));
        assert_eq!(water.id, "chores/water-plants");
    }

    #[test]
    fn duplicate_descriptions_get_distinct_ids() {
        let file = TaskFile::parse("## A\n- [ ] Same\n- [ ] Same\n");
        assert_eq!(file.tasks()[0].id, "a/same");
        assert_eq!(file.tasks()[1].id, "a/same-2");
    }
}
