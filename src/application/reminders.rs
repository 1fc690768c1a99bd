//! Message texts and the due/next-instant bookkeeping shared by the
//! dispatch handlers. Nothing in here touches the store or the notifier.

use crate::domain::floating::effective_weekday;
use crate::domain::models::{
    NotificationAction, Priority, Reminder, Task, WeeklyEvent, format_hhmm, lead_in_range,
    weekday_name,
};
use crate::domain::recurrence::{
    RecurrenceError, RepeatRule, RepeatingObligation, next_occurrence_after,
};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use chrono_tz::Tz;

pub const SNOOZE_OPTIONS_MINUTES: [i64; 2] = [30, 60];
const MINUTES_PER_DAY: i64 = 24 * 60;
const MINUTE_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestKind {
    Morning,
    Evening,
}

/// "Done" plus the snooze choices.
pub fn task_actions(task_id: i64) -> Vec<NotificationAction> {
    let mut actions = vec![NotificationAction::mark_done(task_id)];
    actions.extend(
        SNOOZE_OPTIONS_MINUTES
            .iter()
            .map(|minutes| NotificationAction::snooze(task_id, *minutes)),
    );
    actions
}

pub fn reminder_message(reminder: &Reminder) -> String {
    format!("Reminder: {}", reminder.text)
}

pub fn task_due_message(task: &Task, tz: Tz) -> String {
    match task.due_at {
        Some(due_at) => format!(
            "Task due at {}: {}",
            format_hhmm(due_at.with_timezone(&tz).time()),
            task.title
        ),
        None => format!("Task due: {}", task.title),
    }
}

pub fn repeating_task_message(task: &Task) -> String {
    format!("Time for: {}", task.title)
}

pub fn escalation_message(task: &Task, reminder_count: u32) -> String {
    format!("URGENT (reminder #{reminder_count}): {}", task.title)
}

pub fn event_reminder_message(event: &WeeklyEvent, occurrence: NaiveDate) -> String {
    let day = weekday_name(occurrence.weekday());
    match event.time_start {
        Some(start) => format!("Coming up {day} {}: {}", format_hhmm(start), event.title),
        None => format!("Coming up {day}: {}", event.title),
    }
}

/// Urgent, open and not snoozed at `now`.
pub fn is_escalation_due(task: &Task, now: DateTime<Utc>) -> bool {
    task.priority == Priority::Urgent && !task.done && !task.is_snoozed_at(now)
}

fn next_after(
    rule: &RepeatRule,
    previous: DateTime<Utc>,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<Option<(DateTime<Utc>, RepeatRule)>, RecurrenceError> {
    let previous_local = previous.with_timezone(&tz);
    let rule = rule.pinned_to(previous_local.date_naive());
    let obligation = RepeatingObligation::from_rule(&rule, previous_local.date_naive())?;
    Ok(
        next_occurrence_after(&obligation, &previous_local, &now.with_timezone(&tz))
            .map(|next| (next.with_timezone(&Utc), rule)),
    )
}

/// Where a fired repeating reminder moves to. `None` when it does not repeat.
pub fn next_reminder_instant(
    reminder: &Reminder,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<Option<(DateTime<Utc>, RepeatRule)>, RecurrenceError> {
    match reminder.repeat.as_ref() {
        Some(rule) => next_after(rule, reminder.remind_at, tz, now),
        None => Ok(None),
    }
}

/// Due instant of the row that follows `task` in its series, skipping
/// occurrences that are already in the past.
pub fn next_task_due(
    task: &Task,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<Option<(DateTime<Utc>, RepeatRule)>, RecurrenceError> {
    match (task.repeat.as_ref(), task.due_at) {
        (Some(rule), Some(due_at)) => next_after(rule, due_at, tz, now),
        _ => Ok(None),
    }
}

/// Occurrence date whose reminder minute (`start - lead`, local wall time)
/// is exactly `now`, if it has not been reminded yet. Looks far enough ahead
/// for leads that cross midnight or span days.
pub fn event_occurrence_due(event: &WeeklyEvent, now: DateTime<Utc>, tz: Tz) -> Option<NaiveDate> {
    let time_start = event.time_start?;
    let lead = event.reminder_lead_minutes.filter(|lead| lead_in_range(*lead))?;
    let lead_delta = Duration::try_minutes(lead)?;
    let now_local = now.with_timezone(&tz);
    let now_minute = now_local.format(MINUTE_FORMAT).to_string();
    let today = now_local.date_naive();

    (0..=lead / MINUTES_PER_DAY + 1)
        .filter_map(|offset| today.checked_add_signed(Duration::days(offset)))
        .filter(|date| effective_weekday(event, *date) == Some(date.weekday()))
        .filter(|date| event.last_reminded_on != Some(*date))
        .find(|date| {
            let Some(remind_at) = date.and_time(time_start).checked_sub_signed(lead_delta) else {
                return false;
            };
            remind_at.format(MINUTE_FORMAT).to_string() == now_minute
        })
}

fn local_date(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// Digest text for one recipient, or `None` when there is nothing to say.
/// Morning covers today plus anything overdue; evening previews tomorrow.
pub fn build_digest(
    kind: DigestKind,
    tasks: &[&Task],
    events: &[&WeeklyEvent],
    now: DateTime<Utc>,
    tz: Tz,
) -> Option<String> {
    let today = local_date(now, tz);
    let (day, heading) = match kind {
        DigestKind::Morning => (today, "Good morning! Today"),
        DigestKind::Evening => (today.succ_opt()?, "Tomorrow"),
    };

    let mut lines = Vec::new();
    if kind == DigestKind::Morning {
        for task in tasks.iter().filter(|task| {
            !task.done && task.due_at.is_some_and(|due_at| local_date(due_at, tz) < today)
        }) {
            lines.push(format!("- overdue: {}", task.title));
        }
    }
    let due_on_day = |task: &&&Task| {
        !task.done && task.due_at.is_some_and(|due_at| local_date(due_at, tz) == day)
    };
    for task in tasks.iter().filter(due_on_day) {
        let time = task
            .due_at
            .map(|due_at| format_hhmm(due_at.with_timezone(&tz).time()))
            .unwrap_or_default();
        lines.push(format!("- {time} {}", task.title));
    }
    for event in events
        .iter()
        .filter(|event| effective_weekday(event, day) == Some(day.weekday()))
    {
        match event.time_start {
            Some(start) => lines.push(format!("- {} {}", format_hhmm(start), event.title)),
            None => lines.push(format!("- {}", event.title)),
        }
    }

    if lines.is_empty() {
        return None;
    }
    Some(format!("{heading}:\n{}", lines.join("\n")))
}
