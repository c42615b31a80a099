//! Per-pole summaries computed from the loaded tasks.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::types::{Pole, Status, Task};

pub const DEFAULT_TOP_TASKS: usize = 5;

/// Bounds of the "due soon" window, in days relative to now.
const DUE_SOON_FROM_DAYS: f64 = -1.0;
const DUE_SOON_UNTIL_DAYS: f64 = 7.01;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct PoleKpis {
    pub total: usize,
    pub open: usize,
    pub in_progress: usize,
    pub due_soon: usize,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "count", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// The list returned no rows at all.
    Empty,
    /// Rows came back but none carries a pole; the pole column is likely
    /// missing or misnamed.
    Unclassified,
    Synced(usize),
}

/// Parses an ISO date (`2025-03-01`, midnight UTC), a local date-time
/// without offset (read as UTC) or an RFC 3339 timestamp.
pub fn parse_due_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(parsed.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
}

fn days_between(now: DateTime<Utc>, due: DateTime<Utc>) -> f64 {
    (due - now).num_milliseconds() as f64 / TimeDelta::days(1).num_milliseconds() as f64
}

pub fn pole_kpis(tasks: &[Task], pole: &Pole, now: DateTime<Utc>) -> PoleKpis {
    let mut kpis = PoleKpis::default();

    for task in tasks.iter().filter(|task| &task.pole == pole) {
        kpis.total += 1;
        if task.status == Status::EnCours {
            kpis.in_progress += 1;
        }
        if !task.status.is_open() {
            continue;
        }
        kpis.open += 1;

        let due_soon = parse_due_date(&task.due_date)
            .map(|due| days_between(now, due))
            .is_some_and(|days| (DUE_SOON_FROM_DAYS..=DUE_SOON_UNTIL_DAYS).contains(&days));
        if due_soon {
            kpis.due_soon += 1;
        }
    }

    kpis
}

/// Open tasks of `pole`, earliest due date first (undated last), then
/// status, sort order and title.
pub fn top_tasks<'a>(tasks: &'a [Task], pole: &Pole, limit: usize) -> Vec<&'a Task> {
    let mut open: Vec<(Option<DateTime<Utc>>, &Task)> = tasks
        .iter()
        .filter(|task| &task.pole == pole && task.status.is_open())
        .map(|task| (parse_due_date(&task.due_date), task))
        .collect();

    open.sort_by(|(a_due, a), (b_due, b)| {
        compare_due(*a_due, *b_due)
            .then_with(|| a.status.as_str().cmp(b.status.as_str()))
            .then_with(|| a.sort_order.total_cmp(&b.sort_order))
            .then_with(|| a.title.cmp(&b.title))
    });

    open.into_iter().take(limit).map(|(_, task)| task).collect()
}

fn compare_due(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub fn classify_sync(tasks: &[Task]) -> SyncOutcome {
    if tasks.is_empty() {
        return SyncOutcome::Empty;
    }
    if !tasks.iter().any(|task| task.pole.is_assigned()) {
        return SyncOutcome::Unclassified;
    }
    SyncOutcome::Synced(tasks.len())
}
