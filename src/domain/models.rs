use crate::domain::recurrence::RepeatRule;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: i64,
    pub recipient: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub done: bool,
    pub due_at: Option<DateTime<Utc>>,
    pub repeat: Option<RepeatRule>,
    pub remind_before_minutes: Option<i64>,
    pub due_reminder_sent: bool,
    /// Set once the repeating trigger fired and the next row exists.
    pub series_advanced: bool,
    pub reminder_count: u32,
    pub last_reminded_at: Option<DateTime<Utc>>,
    pub snooze_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.recipient, "task.recipient")?;
        validate_non_empty(&self.title, "task.title")?;
        if let Some(lead) = self.remind_before_minutes {
            if !lead_in_range(lead) {
                return Err(format!(
                    "task.remind_before_minutes must be between 0 and {MAX_LEAD_MINUTES}"
                ));
            }
            if self.due_at.is_none() {
                return Err("task.remind_before_minutes requires task.due_at".to_string());
            }
        }
        if self.repeat.is_some() && self.due_at.is_none() {
            return Err("task.repeat requires task.due_at".to_string());
        }
        Ok(())
    }

    pub fn is_snoozed_at(&self, now: DateTime<Utc>) -> bool {
        self.snooze_until.is_some_and(|until| until > now)
    }

    /// Instant at which the due-date-relative reminder becomes due.
    pub fn due_reminder_at(&self) -> Option<DateTime<Utc>> {
        let due_at = self.due_at?;
        let lead = self.remind_before_minutes.filter(|lead| lead_in_range(*lead))?;
        due_at.checked_sub_signed(Duration::try_minutes(lead)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reminder {
    pub id: i64,
    pub recipient: String,
    pub text: String,
    pub remind_at: DateTime<Utc>,
    pub repeat: Option<RepeatRule>,
    pub fired_at: Option<DateTime<Utc>>,
}

impl Reminder {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.recipient, "reminder.recipient")?;
        validate_non_empty(&self.text, "reminder.text")
    }
}

/// ISO-8601 week, keyed by ISO year so week 1 of different years never collide.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IsoWeekKey {
    pub year: i32,
    pub week: u32,
}

impl IsoWeekKey {
    pub fn of(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (year, week) = value.trim().split_once("-W")?;
        let year = year.parse::<i32>().ok()?;
        let week = week.parse::<u32>().ok()?;
        if !(1..=53).contains(&week) {
            return None;
        }
        Some(Self { year, week })
    }
}

impl fmt::Display for IsoWeekKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-W{:02}", self.year, self.week)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FloatingConfirmation {
    pub day: Weekday,
    pub week: IsoWeekKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WeeklySchedule {
    Fixed {
        day: Weekday,
    },
    Floating {
        candidates: Vec<Weekday>,
        confirmation: Option<FloatingConfirmation>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WeeklyEvent {
    pub id: i64,
    pub recipient: String,
    pub title: String,
    pub schedule: WeeklySchedule,
    pub time_start: Option<NaiveTime>,
    pub time_end: Option<NaiveTime>,
    pub reminder_lead_minutes: Option<i64>,
    pub last_reminded_on: Option<NaiveDate>,
}

impl WeeklyEvent {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.recipient, "weekly_event.recipient")?;
        validate_non_empty(&self.title, "weekly_event.title")?;
        if let WeeklySchedule::Floating { candidates, .. } = &self.schedule {
            if candidates.len() < 2 {
                return Err("weekly_event.candidates must list at least two days".to_string());
            }
        }
        if let (Some(start), Some(end)) = (self.time_start, self.time_end) {
            if end <= start {
                return Err("weekly_event.time_end must be after time_start".to_string());
            }
        }
        if self.reminder_lead_minutes.is_some_and(|lead| !lead_in_range(lead)) {
            return Err(format!(
                "weekly_event.reminder_lead_minutes must be between 0 and {MAX_LEAD_MINUTES}"
            ));
        }
        Ok(())
    }

    pub fn is_floating(&self) -> bool {
        matches!(self.schedule, WeeklySchedule::Floating { .. })
    }
}

/// Locally persisted copy of a remote calendar event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalendarEvent {
    pub id: Option<i64>,
    pub remote_uid: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub all_day: bool,
    pub recurrence: Option<String>,
    pub shared: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl CalendarEvent {
    /// Fields reconciliation compares; bookkeeping columns are ignored.
    pub fn content_differs(&self, other: &CalendarEvent) -> bool {
        self.title != other.title
            || self.description != other.description
            || self.location != other.location
            || self.start_at != other.start_at
            || self.end_at != other.end_at
            || self.all_day != other.all_day
    }

    pub fn is_local_only(&self) -> bool {
        self.last_synced_at.is_none()
    }
}

/// Event as exchanged with the remote calendar. Times are RFC 3339 for timed
/// events and `YYYY-MM-DD` for all-day events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteEvent {
    pub uid: String,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: String,
    pub end: String,
    pub all_day: bool,
    pub recurrence: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Reminder,
    TaskDueReminder,
    RepeatingTask,
    UrgentTask,
    WeeklyEvent,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Reminder => "reminder",
            EntityKind::TaskDueReminder => "task_due_reminder",
            EntityKind::RepeatingTask => "repeating_task",
            EntityKind::UrgentTask => "urgent_task",
            EntityKind::WeeklyEvent => "weekly_event",
        }
    }
}

/// "This entity is due for notification at this instant."
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DueSignal {
    pub entity_id: i64,
    pub kind: EntityKind,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationAction {
    pub label: String,
    pub data: String,
}

impl NotificationAction {
    pub fn mark_done(task_id: i64) -> Self {
        Self {
            label: "Done".to_string(),
            data: format!("task:done:{task_id}"),
        }
    }

    pub fn snooze(task_id: i64, minutes: i64) -> Self {
        Self {
            label: format!("Snooze {minutes}m"),
            data: format!("task:snooze:{task_id}:{minutes}"),
        }
    }

    pub fn confirm_day(event_id: i64, day: Weekday, week: IsoWeekKey) -> Self {
        Self {
            label: weekday_name(day).to_string(),
            data: format!("weekly:confirm:{event_id}:{}:{week}", weekday_index(day)),
        }
    }
}

/// Longest reminder lead accepted for tasks and weekly events (one year).
pub const MAX_LEAD_MINUTES: i64 = 366 * 24 * 60;

pub fn lead_in_range(lead: i64) -> bool {
    (0..=MAX_LEAD_MINUTES).contains(&lead)
}

pub(crate) fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

pub(crate) fn validate_hhmm(value: &str, field_name: &str) -> Result<(), String> {
    parse_hhmm(value)
        .map(|_| ())
        .ok_or_else(|| format!("{field_name} must be HH:MM"))
}

/// Strict `HH:MM` (hour 0-23, minute 0-59).
pub fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    let (hour_str, minute_str) = value.trim().split_once(':')?;
    if minute_str.len() != 2 || hour_str.is_empty() || hour_str.len() > 2 {
        return None;
    }
    let hour = hour_str.parse::<u32>().ok()?;
    let minute = minute_str.parse::<u32>().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

pub fn format_hhmm(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

pub fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

pub fn parse_weekday(value: &str) -> Option<Weekday> {
    value.trim().parse::<Weekday>().ok()
}

/// 0 = Sunday ... 6 = Saturday.
pub fn weekday_index(weekday: Weekday) -> i64 {
    i64::from(weekday.num_days_from_sunday())
}

pub fn weekday_from_index(index: i64) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Sun),
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn sample_task() -> Task {
        Task {
            id: 1,
            recipient: "chat-1".to_string(),
            title: "Pay rent".to_string(),
            description: None,
            priority: Priority::Normal,
            done: false,
            due_at: Some(fixed_time("2024-06-03T09:00:00Z")),
            repeat: None,
            remind_before_minutes: Some(30),
            due_reminder_sent: false,
            series_advanced: false,
            reminder_count: 0,
            last_reminded_at: None,
            snooze_until: None,
            created_at: fixed_time("2024-06-01T08:00:00Z"),
        }
    }

    fn sample_mirror() -> CalendarEvent {
        CalendarEvent {
            id: Some(3),
            remote_uid: Some("abc".to_string()),
            title: "Dentist".to_string(),
            description: None,
            location: Some("Main St".to_string()),
            start_at: fixed_time("2024-06-05T10:00:00Z"),
            end_at: fixed_time("2024-06-05T11:00:00Z"),
            all_day: false,
            recurrence: None,
            shared: false,
            last_synced_at: None,
        }
    }

    #[test]
    fn task_validate_rejects_reminder_without_due_date() {
        let mut task = sample_task();
        assert!(task.validate().is_ok());
        task.due_at = None;
        assert!(task.validate().is_err());
    }

    #[test]
    fn task_due_reminder_instant_subtracts_lead() {
        let task = sample_task();
        assert_eq!(task.due_reminder_at(), Some(fixed_time("2024-06-03T08:30:00Z")));
    }

    #[test]
    fn oversized_leads_are_rejected_and_never_overflow() {
        let mut task = sample_task();
        task.remind_before_minutes = Some(MAX_LEAD_MINUTES);
        assert!(task.validate().is_ok());
        task.remind_before_minutes = Some(MAX_LEAD_MINUTES + 1);
        assert!(task.validate().is_err());

        // Unvalidated rows yield no reminder instead of overflowing.
        task.remind_before_minutes = Some(i64::MAX);
        assert_eq!(task.due_reminder_at(), None);
    }

    #[test]
    fn snooze_only_counts_while_in_the_future() {
        let mut task = sample_task();
        task.snooze_until = Some(fixed_time("2024-06-03T10:00:00Z"));
        assert!(task.is_snoozed_at(fixed_time("2024-06-03T09:59:00Z")));
        assert!(!task.is_snoozed_at(fixed_time("2024-06-03T10:00:00Z")));
    }

    #[test]
    fn content_differs_ignores_bookkeeping_columns() {
        let local = sample_mirror();
        let mut other = local.clone();
        other.id = None;
        other.last_synced_at = Some(fixed_time("2024-06-01T00:00:00Z"));
        other.shared = true;
        assert!(!local.content_differs(&other));

        other.location = None;
        assert!(local.content_differs(&other));
    }

    #[test]
    fn parse_hhmm_is_strict() {
        assert_eq!(parse_hhmm("09:00"), NaiveTime::from_hms_opt(9, 0, 0));
        assert_eq!(parse_hhmm("7:05"), NaiveTime::from_hms_opt(7, 5, 0));
        assert!(parse_hhmm("24:00").is_none());
        assert!(parse_hhmm("09:0").is_none());
        assert!(parse_hhmm("0900").is_none());
        assert!(parse_hhmm("09:00:00").is_none());
    }

    #[test]
    fn iso_week_key_formats_and_parses() {
        let date = NaiveDate::from_ymd_opt(2024, 12, 30).expect("valid date");
        let key = IsoWeekKey::of(date);
        assert_eq!(key, IsoWeekKey { year: 2025, week: 1 });
        assert_eq!(key.to_string(), "2025-W01");
        assert_eq!(IsoWeekKey::parse("2025-W01"), Some(key));
        assert!(IsoWeekKey::parse("2025-W54").is_none());
    }

    #[test]
    fn floating_event_needs_two_candidates() {
        let event = WeeklyEvent {
            id: 1,
            recipient: "chat-1".to_string(),
            title: "Groceries".to_string(),
            schedule: WeeklySchedule::Floating {
                candidates: vec![Weekday::Sat],
                confirmation: None,
            },
            time_start: NaiveTime::from_hms_opt(10, 0, 0),
            time_end: None,
            reminder_lead_minutes: Some(30),
            last_reminded_on: None,
        };
        assert!(event.validate().is_err());
    }

    proptest! {
        #[test]
        fn weekday_index_roundtrips(index in 0i64..7) {
            let weekday = weekday_from_index(index).expect("index in range");
            prop_assert_eq!(weekday_index(weekday), index);
        }
    }
}
