use crate::domain::models::{
    CalendarEvent, FloatingConfirmation, IsoWeekKey, Priority, Reminder, Task, WeeklyEvent,
    WeeklySchedule, format_hhmm, parse_hhmm, weekday_from_index, weekday_index,
};
use crate::domain::recurrence::{RepeatKind, RepeatRule};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::rule_store::{RuleStore, follow_up_task, is_repeating, trigger_anchor};
use crate::infrastructure::storage::{
    decode_optional_timestamp, decode_timestamp, encode_timestamp, open_connection,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::{Path, PathBuf};
use tracing::warn;

const REMINDER_COLUMNS: &str = "id, recipient, text, remind_at, repeat_rule, fired_at";
const TASK_COLUMNS: &str = "id, recipient, title, description, priority, done, due_at, \
     repeat_rule, remind_before_minutes, due_reminder_sent, series_advanced, reminder_count, \
     last_reminded_at, snooze_until, created_at";
const WEEKLY_COLUMNS: &str = "id, recipient, title, day_of_week, is_floating, candidate_days, \
     confirmed_day, confirmed_week, time_start, time_end, reminder_lead_minutes, last_reminded_on";
const CALENDAR_COLUMNS: &str = "id, remote_uid, title, description, location, start_at, end_at, \
     all_day, recurrence, shared, last_synced_at";

#[derive(Debug, Clone)]
pub struct SqliteRuleStore {
    db_path: PathBuf,
}

impl SqliteRuleStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }

    fn query_tasks(
        &self,
        where_clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Task>, InfraError> {
        let connection = self.connect()?;
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE {where_clause} ORDER BY id");
        let mut statement = connection.prepare(&sql)?;
        let rows = statement
            .query_map(params, read_task)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    fn query_weekly(
        &self,
        where_clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<WeeklyEvent>, InfraError> {
        let connection = self.connect()?;
        let sql =
            format!("SELECT {WEEKLY_COLUMNS} FROM weekly_events WHERE {where_clause} ORDER BY id");
        let mut statement = connection.prepare(&sql)?;
        let rows = statement
            .query_map(params, read_weekly)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(WeeklyRow::into_event).collect()
    }

    fn expect_one(changed: usize, kind: &str, id: i64) -> Result<(), InfraError> {
        if changed == 0 {
            return Err(InfraError::NotFound(format!("{kind} {id}")));
        }
        Ok(())
    }
}

struct ReminderRow {
    id: i64,
    recipient: String,
    text: String,
    remind_at: String,
    repeat_rule: Option<String>,
    fired_at: Option<String>,
}

fn read_reminder(row: &Row<'_>) -> rusqlite::Result<ReminderRow> {
    Ok(ReminderRow {
        id: row.get(0)?,
        recipient: row.get(1)?,
        text: row.get(2)?,
        remind_at: row.get(3)?,
        repeat_rule: row.get(4)?,
        fired_at: row.get(5)?,
    })
}

impl ReminderRow {
    fn into_reminder(self) -> Result<Reminder, InfraError> {
        Ok(Reminder {
            id: self.id,
            recipient: self.recipient,
            text: self.text,
            remind_at: decode_timestamp(&self.remind_at, "reminders.remind_at")?,
            repeat: decode_repeat_rule(self.repeat_rule, "reminder", self.id),
            fired_at: decode_optional_timestamp(self.fired_at, "reminders.fired_at")?,
        })
    }
}

struct TaskRow {
    id: i64,
    recipient: String,
    title: String,
    description: Option<String>,
    priority: String,
    done: bool,
    due_at: Option<String>,
    repeat_rule: Option<String>,
    remind_before_minutes: Option<i64>,
    due_reminder_sent: bool,
    series_advanced: bool,
    reminder_count: i64,
    last_reminded_at: Option<String>,
    snooze_until: Option<String>,
    created_at: String,
}

fn read_task(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        recipient: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        priority: row.get(4)?,
        done: row.get(5)?,
        due_at: row.get(6)?,
        repeat_rule: row.get(7)?,
        remind_before_minutes: row.get(8)?,
        due_reminder_sent: row.get(9)?,
        series_advanced: row.get(10)?,
        reminder_count: row.get(11)?,
        last_reminded_at: row.get(12)?,
        snooze_until: row.get(13)?,
        created_at: row.get(14)?,
    })
}

impl TaskRow {
    fn into_task(self) -> Result<Task, InfraError> {
        let priority = Priority::parse(&self.priority).ok_or_else(|| {
            InfraError::InvalidData(format!(
                "task {} has unknown priority '{}'",
                self.id, self.priority
            ))
        })?;
        Ok(Task {
            id: self.id,
            recipient: self.recipient,
            title: self.title,
            description: self.description,
            priority,
            done: self.done,
            due_at: decode_optional_timestamp(self.due_at, "tasks.due_at")?,
            repeat: decode_repeat_rule(self.repeat_rule, "task", self.id),
            remind_before_minutes: self.remind_before_minutes,
            due_reminder_sent: self.due_reminder_sent,
            series_advanced: self.series_advanced,
            reminder_count: u32::try_from(self.reminder_count.max(0)).unwrap_or(u32::MAX),
            last_reminded_at: decode_optional_timestamp(
                self.last_reminded_at,
                "tasks.last_reminded_at",
            )?,
            snooze_until: decode_optional_timestamp(self.snooze_until, "tasks.snooze_until")?,
            created_at: decode_timestamp(&self.created_at, "tasks.created_at")?,
        })
    }
}

struct WeeklyRow {
    id: i64,
    recipient: String,
    title: String,
    day_of_week: i64,
    is_floating: bool,
    candidate_days: Option<String>,
    confirmed_day: Option<i64>,
    confirmed_week: Option<String>,
    time_start: Option<String>,
    time_end: Option<String>,
    reminder_lead_minutes: Option<i64>,
    last_reminded_on: Option<String>,
}

fn read_weekly(row: &Row<'_>) -> rusqlite::Result<WeeklyRow> {
    Ok(WeeklyRow {
        id: row.get(0)?,
        recipient: row.get(1)?,
        title: row.get(2)?,
        day_of_week: row.get(3)?,
        is_floating: row.get(4)?,
        candidate_days: row.get(5)?,
        confirmed_day: row.get(6)?,
        confirmed_week: row.get(7)?,
        time_start: row.get(8)?,
        time_end: row.get(9)?,
        reminder_lead_minutes: row.get(10)?,
        last_reminded_on: row.get(11)?,
    })
}

impl WeeklyRow {
    fn into_event(self) -> Result<WeeklyEvent, InfraError> {
        let id = self.id;
        let weekday = |index: i64| {
            weekday_from_index(index).ok_or_else(|| {
                InfraError::InvalidData(format!("weekly event {id} has day index {index}"))
            })
        };

        let schedule = if self.is_floating {
            let candidates = self
                .candidate_days
                .as_deref()
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| {
                    value
                        .parse::<i64>()
                        .map_err(|_| {
                            InfraError::InvalidData(format!(
                                "weekly event {id} has candidate '{value}'"
                            ))
                        })
                        .and_then(weekday)
                })
                .collect::<Result<Vec<_>, _>>()?;
            let confirmation = match (self.confirmed_day, self.confirmed_week.as_deref()) {
                (Some(day), Some(week)) => Some(FloatingConfirmation {
                    day: weekday(day)?,
                    week: IsoWeekKey::parse(week).ok_or_else(|| {
                        InfraError::InvalidData(format!(
                            "weekly event {id} has confirmed week '{week}'"
                        ))
                    })?,
                }),
                _ => None,
            };
            WeeklySchedule::Floating {
                candidates,
                confirmation,
            }
        } else {
            WeeklySchedule::Fixed {
                day: weekday(self.day_of_week)?,
            }
        };

        Ok(WeeklyEvent {
            id,
            recipient: self.recipient,
            title: self.title,
            schedule,
            time_start: decode_time(self.time_start, id)?,
            time_end: decode_time(self.time_end, id)?,
            reminder_lead_minutes: self.reminder_lead_minutes,
            last_reminded_on: self
                .last_reminded_on
                .as_deref()
                .map(|value| {
                    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|error| {
                        InfraError::InvalidData(format!(
                            "weekly event {id} last_reminded_on '{value}': {error}"
                        ))
                    })
                })
                .transpose()?,
        })
    }
}

struct CalendarRow {
    id: i64,
    remote_uid: Option<String>,
    title: String,
    description: Option<String>,
    location: Option<String>,
    start_at: String,
    end_at: String,
    all_day: bool,
    recurrence: Option<String>,
    shared: bool,
    last_synced_at: Option<String>,
}

fn read_calendar(row: &Row<'_>) -> rusqlite::Result<CalendarRow> {
    Ok(CalendarRow {
        id: row.get(0)?,
        remote_uid: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        location: row.get(4)?,
        start_at: row.get(5)?,
        end_at: row.get(6)?,
        all_day: row.get(7)?,
        recurrence: row.get(8)?,
        shared: row.get(9)?,
        last_synced_at: row.get(10)?,
    })
}

impl CalendarRow {
    fn into_event(self) -> Result<CalendarEvent, InfraError> {
        Ok(CalendarEvent {
            id: Some(self.id),
            remote_uid: self.remote_uid,
            title: self.title,
            description: self.description,
            location: self.location,
            start_at: decode_timestamp(&self.start_at, "calendar_events.start_at")?,
            end_at: decode_timestamp(&self.end_at, "calendar_events.end_at")?,
            all_day: self.all_day,
            recurrence: self.recurrence,
            shared: self.shared,
            last_synced_at: decode_optional_timestamp(
                self.last_synced_at,
                "calendar_events.last_synced_at",
            )?,
        })
    }
}

/// A rule that no longer parses is kept as a `none` rule so the row still
/// loads; the scheduler then treats the series as exhausted.
fn decode_repeat_rule(raw: Option<String>, kind: &str, id: i64) -> Option<RepeatRule> {
    let raw = raw?;
    match RepeatRule::from_json(&raw) {
        Ok(rule) => Some(rule),
        Err(error) => {
            warn!(entity = kind, id, %error, "stored repeat rule is malformed");
            Some(RepeatRule::new(RepeatKind::None, None))
        }
    }
}

fn decode_time(raw: Option<String>, id: i64) -> Result<Option<NaiveTime>, InfraError> {
    raw.as_deref()
        .map(|value| {
            parse_hhmm(value).ok_or_else(|| {
                InfraError::InvalidData(format!("weekly event {id} has time '{value}'"))
            })
        })
        .transpose()
}

fn encode_candidates(candidates: &[Weekday]) -> String {
    candidates
        .iter()
        .map(|day| weekday_index(*day).to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn insert_task_row(connection: &Connection, task: &Task) -> Result<i64, InfraError> {
    let repeat_anchor = task
        .repeat
        .as_ref()
        .filter(|_| is_repeating(task))
        .map(trigger_anchor);
    connection.execute(
        "INSERT INTO tasks (recipient, title, description, priority, done, due_at, repeat_rule,
             repeat_anchor, remind_before_minutes, due_reminder_at, due_reminder_sent,
             series_advanced, reminder_count, last_reminded_at, snooze_until, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            task.recipient,
            task.title,
            task.description,
            task.priority.as_str(),
            task.done,
            task.due_at.map(encode_timestamp),
            task.repeat.as_ref().map(RepeatRule::to_json),
            repeat_anchor,
            task.remind_before_minutes,
            task.due_reminder_at().map(encode_timestamp),
            task.due_reminder_sent,
            task.series_advanced,
            i64::from(task.reminder_count),
            task.last_reminded_at.map(encode_timestamp),
            task.snooze_until.map(encode_timestamp),
            encode_timestamp(task.created_at),
        ],
    )?;
    Ok(connection.last_insert_rowid())
}

impl RuleStore for SqliteRuleStore {
    fn insert_reminder(&self, reminder: &Reminder) -> Result<Reminder, InfraError> {
        reminder.validate().map_err(InfraError::InvalidData)?;
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO reminders (recipient, text, remind_at, repeat_rule, fired_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                reminder.recipient,
                reminder.text,
                encode_timestamp(reminder.remind_at),
                reminder.repeat.as_ref().map(RepeatRule::to_json),
                reminder.fired_at.map(encode_timestamp),
            ],
        )?;
        Ok(Reminder {
            id: connection.last_insert_rowid(),
            ..reminder.clone()
        })
    }

    fn due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<Reminder>, InfraError> {
        let connection = self.connect()?;
        let sql = format!(
            "SELECT {REMINDER_COLUMNS} FROM reminders
             WHERE fired_at IS NULL AND remind_at <= ?1 ORDER BY remind_at, id"
        );
        let mut statement = connection.prepare(&sql)?;
        let rows = statement
            .query_map(params![encode_timestamp(now)], read_reminder)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(ReminderRow::into_reminder).collect()
    }

    fn mark_reminder_fired(
        &self,
        reminder_id: i64,
        fired_at: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        let changed = self.connect()?.execute(
            "UPDATE reminders SET fired_at = ?1 WHERE id = ?2",
            params![encode_timestamp(fired_at), reminder_id],
        )?;
        Self::expect_one(changed, "reminder", reminder_id)
    }

    fn reschedule_reminder(
        &self,
        reminder_id: i64,
        next_at: DateTime<Utc>,
        repeat: &RepeatRule,
    ) -> Result<(), InfraError> {
        let changed = self.connect()?.execute(
            "UPDATE reminders SET remind_at = ?1, repeat_rule = ?2, fired_at = NULL WHERE id = ?3",
            params![encode_timestamp(next_at), repeat.to_json(), reminder_id],
        )?;
        Self::expect_one(changed, "reminder", reminder_id)
    }

    fn insert_task(&self, task: &Task) -> Result<Task, InfraError> {
        task.validate().map_err(InfraError::InvalidData)?;
        let connection = self.connect()?;
        let id = insert_task_row(&connection, task)?;
        Ok(Task {
            id,
            ..task.clone()
        })
    }

    fn get_task(&self, task_id: i64) -> Result<Option<Task>, InfraError> {
        let connection = self.connect()?;
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        connection
            .query_row(&sql, params![task_id], read_task)
            .optional()?
            .map(TaskRow::into_task)
            .transpose()
    }

    fn open_tasks(&self) -> Result<Vec<Task>, InfraError> {
        self.query_tasks("done = 0", [])
    }

    fn tasks_with_due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<Task>, InfraError> {
        self.query_tasks(
            "done = 0 AND due_reminder_sent = 0 AND due_reminder_at <= ?1",
            params![encode_timestamp(now)],
        )
    }

    fn mark_task_reminder_sent(&self, task_id: i64) -> Result<(), InfraError> {
        let changed = self.connect()?.execute(
            "UPDATE tasks SET due_reminder_sent = 1 WHERE id = ?1",
            params![task_id],
        )?;
        Self::expect_one(changed, "task", task_id)
    }

    fn urgent_open_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, InfraError> {
        self.query_tasks(
            "priority = 'urgent' AND done = 0 AND (snooze_until IS NULL OR snooze_until <= ?1)",
            params![encode_timestamp(now)],
        )
    }

    fn record_escalation(
        &self,
        task_id: i64,
        reminder_count: u32,
        reminded_at: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        let changed = self.connect()?.execute(
            "UPDATE tasks SET reminder_count = ?1, last_reminded_at = ?2 WHERE id = ?3",
            params![i64::from(reminder_count), encode_timestamp(reminded_at), task_id],
        )?;
        Self::expect_one(changed, "task", task_id)
    }

    fn repeating_tasks_at(&self, anchor_hhmm: &str) -> Result<Vec<Task>, InfraError> {
        self.query_tasks(
            "repeat_anchor = ?1 AND series_advanced = 0",
            params![anchor_hhmm],
        )
    }

    fn create_next_occurrence(
        &self,
        task_id: i64,
        next_due_at: DateTime<Utc>,
        repeat: &RepeatRule,
        created_at: DateTime<Utc>,
    ) -> Result<Task, InfraError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;

        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let current = transaction
            .query_row(&sql, params![task_id], read_task)
            .optional()?
            .ok_or_else(|| InfraError::NotFound(format!("task {task_id}")))?
            .into_task()?;

        let changed = transaction.execute(
            "UPDATE tasks SET series_advanced = 1 WHERE id = ?1 AND series_advanced = 0",
            params![task_id],
        )?;
        if changed == 0 {
            return Err(InfraError::InvalidData(format!(
                "task {task_id} already has a next occurrence"
            )));
        }

        let next = follow_up_task(&current, next_due_at, repeat, created_at);
        let id = insert_task_row(&transaction, &next)?;
        transaction.commit()?;
        Ok(Task { id, ..next })
    }

    fn end_series(&self, task_id: i64) -> Result<(), InfraError> {
        let changed = self.connect()?.execute(
            "UPDATE tasks SET series_advanced = 1 WHERE id = ?1",
            params![task_id],
        )?;
        Self::expect_one(changed, "task", task_id)
    }

    fn insert_weekly_event(&self, event: &WeeklyEvent) -> Result<WeeklyEvent, InfraError> {
        event.validate().map_err(InfraError::InvalidData)?;
        let (day_of_week, is_floating, candidate_days, confirmation) = match &event.schedule {
            WeeklySchedule::Fixed { day } => (weekday_index(*day), false, None, None),
            WeeklySchedule::Floating {
                candidates,
                confirmation,
            } => (
                candidates.first().copied().map(weekday_index).unwrap_or(0),
                true,
                Some(encode_candidates(candidates)),
                *confirmation,
            ),
        };

        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO weekly_events (recipient, title, day_of_week, is_floating, candidate_days,
                 confirmed_day, confirmed_week, time_start, time_end, reminder_lead_minutes,
                 last_reminded_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                event.recipient,
                event.title,
                day_of_week,
                is_floating,
                candidate_days,
                confirmation.map(|value| weekday_index(value.day)),
                confirmation.map(|value| value.week.to_string()),
                event.time_start.map(format_hhmm),
                event.time_end.map(format_hhmm),
                event.reminder_lead_minutes,
                event.last_reminded_on.map(|date| date.format("%Y-%m-%d").to_string()),
            ],
        )?;
        Ok(WeeklyEvent {
            id: connection.last_insert_rowid(),
            ..event.clone()
        })
    }

    fn get_weekly_event(&self, event_id: i64) -> Result<Option<WeeklyEvent>, InfraError> {
        Ok(self.query_weekly("id = ?1", params![event_id])?.into_iter().next())
    }

    fn weekly_events(&self) -> Result<Vec<WeeklyEvent>, InfraError> {
        self.query_weekly("1 = 1", [])
    }

    fn weekly_events_with_reminders(&self) -> Result<Vec<WeeklyEvent>, InfraError> {
        self.query_weekly(
            "reminder_lead_minutes IS NOT NULL AND time_start IS NOT NULL",
            [],
        )
    }

    fn mark_weekly_event_reminded(
        &self,
        event_id: i64,
        occurrence: NaiveDate,
    ) -> Result<(), InfraError> {
        let changed = self.connect()?.execute(
            "UPDATE weekly_events SET last_reminded_on = ?1 WHERE id = ?2",
            params![occurrence.format("%Y-%m-%d").to_string(), event_id],
        )?;
        Self::expect_one(changed, "weekly event", event_id)
    }

    fn floating_events_unconfirmed(
        &self,
        week: IsoWeekKey,
    ) -> Result<Vec<WeeklyEvent>, InfraError> {
        self.query_weekly(
            "is_floating = 1 AND (confirmed_week IS NULL OR confirmed_week <> ?1)",
            params![week.to_string()],
        )
    }

    fn set_floating_confirmation(
        &self,
        event_id: i64,
        confirmation: Option<FloatingConfirmation>,
    ) -> Result<(), InfraError> {
        let changed = self.connect()?.execute(
            "UPDATE weekly_events SET confirmed_day = ?1, confirmed_week = ?2
             WHERE id = ?3 AND is_floating = 1",
            params![
                confirmation.map(|value| weekday_index(value.day)),
                confirmation.map(|value| value.week.to_string()),
                event_id,
            ],
        )?;
        Self::expect_one(changed, "floating weekly event", event_id)
    }

    fn calendar_events(&self) -> Result<Vec<CalendarEvent>, InfraError> {
        let connection = self.connect()?;
        let sql = format!("SELECT {CALENDAR_COLUMNS} FROM calendar_events ORDER BY start_at, id");
        let mut statement = connection.prepare(&sql)?;
        let rows = statement
            .query_map([], read_calendar)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(CalendarRow::into_event).collect()
    }

    fn upsert_calendar_event(&self, event: &CalendarEvent) -> Result<CalendarEvent, InfraError> {
        let connection = self.connect()?;
        let start_at = encode_timestamp(event.start_at);
        let end_at = encode_timestamp(event.end_at);
        let last_synced_at = event.last_synced_at.map(encode_timestamp);

        let id = match event.id {
            None => {
                connection.execute(
                    "INSERT INTO calendar_events (remote_uid, title, description, location,
                         start_at, end_at, all_day, recurrence, shared, last_synced_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        event.remote_uid,
                        event.title,
                        event.description,
                        event.location,
                        start_at,
                        end_at,
                        event.all_day,
                        event.recurrence,
                        event.shared,
                        last_synced_at,
                    ],
                )?;
                connection.last_insert_rowid()
            }
            Some(id) => {
                let changed = connection.execute(
                    "UPDATE calendar_events SET remote_uid = ?1, title = ?2, description = ?3,
                         location = ?4, start_at = ?5, end_at = ?6, all_day = ?7, recurrence = ?8,
                         shared = ?9, last_synced_at = ?10
                     WHERE id = ?11",
                    params![
                        event.remote_uid,
                        event.title,
                        event.description,
                        event.location,
                        start_at,
                        end_at,
                        event.all_day,
                        event.recurrence,
                        event.shared,
                        last_synced_at,
                        id,
                    ],
                )?;
                Self::expect_one(changed, "calendar event", id)?;
                id
            }
        };

        Ok(CalendarEvent {
            id: Some(id),
            ..event.clone()
        })
    }

    fn delete_calendar_event(&self, event_id: i64) -> Result<(), InfraError> {
        self.connect()?
            .execute("DELETE FROM calendar_events WHERE id = ?1", params![event_id])?;
        Ok(())
    }

    fn set_calendar_event_uid(&self, event_id: i64, remote_uid: &str) -> Result<(), InfraError> {
        let changed = self.connect()?.execute(
            "UPDATE calendar_events SET remote_uid = ?1 WHERE id = ?2",
            params![remote_uid, event_id],
        )?;
        Self::expect_one(changed, "calendar event", event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::initialize_database;
    use tempfile::TempDir;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn store() -> (TempDir, SqliteRuleStore) {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("taskmate.sqlite");
        initialize_database(&path).expect("init database");
        (dir, SqliteRuleStore::new(path))
    }

    fn urgent_task(snooze_until: Option<&str>) -> Task {
        Task {
            id: 0,
            recipient: "chat-1".to_string(),
            title: "Call plumber".to_string(),
            description: Some("kitchen sink".to_string()),
            priority: Priority::Urgent,
            done: false,
            due_at: Some(fixed_time("2024-06-03T12:00:00Z")),
            repeat: None,
            remind_before_minutes: Some(60),
            due_reminder_sent: false,
            series_advanced: false,
            reminder_count: 0,
            last_reminded_at: None,
            snooze_until: snooze_until.map(fixed_time),
            created_at: fixed_time("2024-06-03T08:00:00Z"),
        }
    }

    #[test]
    fn reminders_roundtrip_and_due_query_respects_marker() {
        let (_dir, store) = store();
        let reminder = store
            .insert_reminder(&Reminder {
                id: 0,
                recipient: "chat-1".to_string(),
                text: "Take out bins".to_string(),
                remind_at: fixed_time("2024-06-03T18:00:00Z"),
                repeat: Some(RepeatRule::new(RepeatKind::Weekly, Some("20:00"))),
                fired_at: None,
            })
            .expect("insert");

        assert!(store.due_reminders(fixed_time("2024-06-03T17:59:00Z")).expect("query").is_empty());
        let due = store.due_reminders(fixed_time("2024-06-03T18:00:00Z")).expect("query");
        assert_eq!(due, vec![reminder.clone()]);

        store
            .mark_reminder_fired(reminder.id, fixed_time("2024-06-03T18:00:00Z"))
            .expect("mark");
        assert!(store.due_reminders(fixed_time("2024-06-03T19:00:00Z")).expect("query").is_empty());

        store
            .reschedule_reminder(
                reminder.id,
                fixed_time("2024-06-10T18:00:00Z"),
                &RepeatRule::new(RepeatKind::Weekly, Some("20:00")),
            )
            .expect("reschedule");
        assert_eq!(
            store
                .due_reminders(fixed_time("2024-06-10T18:00:00Z"))
                .expect("query")
                .len(),
            1
        );
    }

    #[test]
    fn urgent_query_excludes_snoozed_and_done_tasks() {
        let (_dir, store) = store();
        let awake = store.insert_task(&urgent_task(None)).expect("insert");
        store
            .insert_task(&urgent_task(Some("2024-06-03T13:00:00Z")))
            .expect("insert snoozed");
        let mut done = urgent_task(None);
        done.done = true;
        store.insert_task(&done).expect("insert done");

        let at_noon = store.urgent_open_tasks(fixed_time("2024-06-03T12:30:00Z")).expect("query");
        assert_eq!(at_noon.iter().map(|task| task.id).collect::<Vec<_>>(), vec![awake.id]);
        assert_eq!(
            store.urgent_open_tasks(fixed_time("2024-06-03T13:01:00Z")).expect("query").len(),
            2
        );

        store
            .record_escalation(awake.id, 3, fixed_time("2024-06-03T13:00:00Z"))
            .expect("record");
        let reloaded = store.get_task(awake.id).expect("get").expect("exists");
        assert_eq!(reloaded.reminder_count, 3);
        assert_eq!(reloaded.last_reminded_at, Some(fixed_time("2024-06-03T13:00:00Z")));
    }

    #[test]
    fn due_reminder_query_uses_lead_time() {
        let (_dir, store) = store();
        let task = store.insert_task(&urgent_task(None)).expect("insert");
        assert!(
            store
                .tasks_with_due_reminders(fixed_time("2024-06-03T10:59:00Z"))
                .expect("query")
                .is_empty()
        );
        assert_eq!(
            store
                .tasks_with_due_reminders(fixed_time("2024-06-03T11:00:00Z"))
                .expect("query")
                .len(),
            1
        );
        store.mark_task_reminder_sent(task.id).expect("mark");
        assert!(
            store
                .tasks_with_due_reminders(fixed_time("2024-06-03T11:30:00Z"))
                .expect("query")
                .is_empty()
        );
    }

    #[test]
    fn next_occurrence_is_created_in_one_transaction() {
        let (_dir, store) = store();
        let mut task = urgent_task(None);
        task.priority = Priority::Normal;
        task.repeat = Some(RepeatRule::new(RepeatKind::Daily, Some("8:00")));
        let task = store.insert_task(&task).expect("insert");
        let rule = task.repeat.clone().expect("repeating");

        assert_eq!(store.repeating_tasks_at("08:00").expect("query"), vec![task.clone()]);

        let next = store
            .create_next_occurrence(
                task.id,
                fixed_time("2024-06-04T06:00:00Z"),
                &rule,
                fixed_time("2024-06-03T06:00:00Z"),
            )
            .expect("advance");
        assert_eq!(next.due_at, Some(fixed_time("2024-06-04T06:00:00Z")));
        assert_eq!(store.repeating_tasks_at("08:00").expect("query"), vec![next.clone()]);
        assert!(
            store
                .create_next_occurrence(
                    task.id,
                    fixed_time("2024-06-04T06:00:00Z"),
                    &rule,
                    fixed_time("2024-06-03T06:00:00Z"),
                )
                .is_err()
        );
        assert_eq!(store.open_tasks().expect("open").len(), 2);
    }

    #[test]
    fn malformed_repeat_rule_loads_as_none_rule() {
        let (dir, store) = store();
        let task = store
            .insert_task(&{
                let mut task = urgent_task(None);
                task.repeat = Some(RepeatRule::new(RepeatKind::Daily, None));
                task
            })
            .expect("insert");
        let connection = open_connection(&dir.path().join("taskmate.sqlite")).expect("open");
        connection
            .execute(
                "UPDATE tasks SET repeat_rule = '{not json' WHERE id = ?1",
                params![task.id],
            )
            .expect("corrupt");

        let loaded = store.get_task(task.id).expect("get").expect("exists");
        assert_eq!(loaded.repeat.map(|rule| rule.kind), Some(RepeatKind::None));
    }

    #[test]
    fn floating_confirmation_roundtrip() {
        let (_dir, store) = store();
        let event = store
            .insert_weekly_event(&WeeklyEvent {
                id: 0,
                recipient: "chat-1".to_string(),
                title: "Football".to_string(),
                schedule: WeeklySchedule::Floating {
                    candidates: vec![Weekday::Sat, Weekday::Sun],
                    confirmation: None,
                },
                time_start: NaiveTime::from_hms_opt(15, 0, 0),
                time_end: NaiveTime::from_hms_opt(17, 0, 0),
                reminder_lead_minutes: Some(90),
                last_reminded_on: None,
            })
            .expect("insert");
        let week = IsoWeekKey { year: 2024, week: 23 };

        assert_eq!(store.floating_events_unconfirmed(week).expect("query"), vec![event.clone()]);
        let confirmation = FloatingConfirmation {
            day: Weekday::Sun,
            week,
        };
        store
            .set_floating_confirmation(event.id, Some(confirmation))
            .expect("confirm");
        assert!(store.floating_events_unconfirmed(week).expect("query").is_empty());

        let reloaded = store.get_weekly_event(event.id).expect("get").expect("exists");
        assert_eq!(
            reloaded.schedule,
            WeeklySchedule::Floating {
                candidates: vec![Weekday::Sat, Weekday::Sun],
                confirmation: Some(confirmation),
            }
        );
        assert_eq!(store.weekly_events_with_reminders().expect("query").len(), 1);
    }

    #[test]
    fn calendar_rows_insert_update_delete() {
        let (_dir, store) = store();
        let inserted = store
            .upsert_calendar_event(&CalendarEvent {
                id: None,
                remote_uid: Some("abc".to_string()),
                title: "School play".to_string(),
                description: None,
                location: Some("Hall".to_string()),
                start_at: fixed_time("2024-06-07T16:00:00Z"),
                end_at: fixed_time("2024-06-07T18:00:00Z"),
                all_day: false,
                recurrence: None,
                shared: false,
                last_synced_at: Some(fixed_time("2024-06-01T00:00:00Z")),
            })
            .expect("insert");
        let id = inserted.id.expect("assigned id");

        let mut changed = inserted.clone();
        changed.title = "School play (dress rehearsal)".to_string();
        store.upsert_calendar_event(&changed).expect("update");
        assert_eq!(store.calendar_events().expect("list"), vec![changed]);

        store.set_calendar_event_uid(id, "def").expect("set uid");
        assert_eq!(
            store.calendar_events().expect("list")[0].remote_uid.as_deref(),
            Some("def")
        );

        store.delete_calendar_event(id).expect("delete");
        assert!(store.calendar_events().expect("list").is_empty());
    }
}
