use crate::domain::floating::effective_weekday;
use crate::domain::models::{
    CalendarEvent, IsoWeekKey, RemoteEvent, Task, WeeklyEvent, WeeklySchedule,
};
use crate::domain::recurrence::resolve_local;
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, SecondsFormat, Utc, Weekday};
use chrono_tz::Tz;

const UID_PREFIX: &str = "tm";
const TASK_EVENT_MINUTES: i64 = 30;
const DEFAULT_SLOT_MINUTES: i64 = 60;
const ALL_DAY_FORMAT: &str = "%Y-%m-%d";

/// Local entities projected onto the remote calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticKind {
    Task,
    Slot,
    Event,
}

impl SyntheticKind {
    fn as_str(self) -> &'static str {
        match self {
            SyntheticKind::Task => "task",
            SyntheticKind::Slot => "slot",
            SyntheticKind::Event => "event",
        }
    }
}

/// Deterministic UID for a local entity, e.g. `tmtask000042`.
pub fn synthetic_uid(kind: SyntheticKind, id: i64) -> String {
    format!("{UID_PREFIX}{}{id:06}", kind.as_str())
}

/// True for UIDs that mirror a local task or weekly slot; pulling those back
/// would only duplicate local state.
pub fn is_projection_uid(uid: &str) -> bool {
    [SyntheticKind::Task, SyntheticKind::Slot].iter().any(|kind| {
        uid.strip_prefix(UID_PREFIX)
            .and_then(|rest| rest.strip_prefix(kind.as_str()))
            .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
    })
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct GoogleEventTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(rename = "dateTime", skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    #[serde(rename = "timeZone", skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct GoogleCalendarEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub start: GoogleEventTime,
    #[serde(default)]
    pub end: GoogleEventTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Vec<String>>,
}

fn wire_time(time: &GoogleEventTime) -> (String, bool) {
    match (&time.date_time, &time.date) {
        (Some(date_time), _) => (date_time.clone(), false),
        (None, Some(date)) => (date.clone(), true),
        (None, None) => (String::new(), false),
    }
}

/// Cancelled events are dropped; everything else is passed on, including
/// events without an id, so reconciliation can report them.
pub fn from_wire(event: GoogleCalendarEvent) -> Option<RemoteEvent> {
    let cancelled = event
        .status
        .as_deref()
        .is_some_and(|status| status.eq_ignore_ascii_case("cancelled"));
    if cancelled {
        return None;
    }

    let (start, all_day) = wire_time(&event.start);
    let (end, _) = wire_time(&event.end);
    Some(RemoteEvent {
        uid: event.id.map(|id| id.trim().to_string()).unwrap_or_default(),
        title: event.summary.unwrap_or_default(),
        description: event.description,
        location: event.location,
        start,
        end,
        all_day,
        recurrence: event
            .recurrence
            .filter(|lines| !lines.is_empty())
            .map(|lines| lines.join("\n")),
    })
}

pub fn to_wire(event: &RemoteEvent, time_zone: Option<&str>) -> GoogleCalendarEvent {
    let time = |value: &str| {
        if event.all_day {
            GoogleEventTime {
                date: Some(value.to_string()),
                ..GoogleEventTime::default()
            }
        } else {
            GoogleEventTime {
                date_time: Some(value.to_string()),
                time_zone: time_zone.map(ToOwned::to_owned),
                ..GoogleEventTime::default()
            }
        }
    };

    GoogleCalendarEvent {
        id: Some(event.uid.clone()),
        status: Some("confirmed".to_string()),
        summary: Some(event.title.clone()),
        description: event.description.clone(),
        location: event.location.clone(),
        start: time(&event.start),
        end: time(&event.end),
        recurrence: event
            .recurrence
            .as_deref()
            .map(|value| value.lines().map(ToOwned::to_owned).collect()),
    }
}

fn parse_instant(
    value: &str,
    all_day: bool,
    tz: Tz,
    field_name: &str,
) -> Result<DateTime<Utc>, InfraError> {
    if all_day {
        let date = NaiveDate::parse_from_str(value.trim(), ALL_DAY_FORMAT).map_err(|error| {
            InfraError::InvalidData(format!("invalid remote event {field_name} '{value}': {error}"))
        })?;
        return resolve_local(&tz, date.and_time(NaiveTime::MIN))
            .map(|local| local.with_timezone(&Utc))
            .ok_or_else(|| {
                InfraError::InvalidData(format!(
                    "remote event {field_name} '{value}' has no local midnight"
                ))
            });
    }
    DateTime::parse_from_rfc3339(value.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| {
            InfraError::InvalidData(format!("invalid remote event {field_name} '{value}': {error}"))
        })
}

/// Remote event to a mirror row stamped with `synced_at`. All-day dates are
/// read as local midnight in `tz`.
pub fn decode_remote_event(
    event: &RemoteEvent,
    tz: Tz,
    synced_at: DateTime<Utc>,
) -> Result<CalendarEvent, InfraError> {
    if event.uid.trim().is_empty() {
        return Err(InfraError::InvalidData(format!(
            "remote event '{}' has no UID",
            event.title
        )));
    }
    let start_at = parse_instant(&event.start, event.all_day, tz, "start")?;
    let end_at = parse_instant(&event.end, event.all_day, tz, "end")?;
    if end_at < start_at {
        return Err(InfraError::InvalidData(format!(
            "remote event {} ends before it starts",
            event.uid
        )));
    }

    Ok(CalendarEvent {
        id: None,
        remote_uid: Some(event.uid.clone()),
        title: event.title.clone(),
        description: non_empty(event.description.as_deref()),
        location: non_empty(event.location.as_deref()),
        start_at,
        end_at,
        all_day: event.all_day,
        recurrence: event.recurrence.clone(),
        shared: false,
        last_synced_at: Some(synced_at),
    })
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn format_local(instant: DateTime<Utc>, tz: Tz) -> String {
    instant.with_timezone(&tz).to_rfc3339_opts(SecondsFormat::Secs, false)
}

fn format_all_day(instant: DateTime<Utc>, tz: Tz) -> String {
    instant.with_timezone(&tz).date_naive().format(ALL_DAY_FORMAT).to_string()
}

pub fn encode_task(task: &Task, tz: Tz) -> Option<RemoteEvent> {
    let due_at = task.due_at?;
    Some(RemoteEvent {
        uid: synthetic_uid(SyntheticKind::Task, task.id),
        title: task.title.clone(),
        description: non_empty(task.description.as_deref()),
        location: None,
        start: format_local(due_at, tz),
        end: format_local(due_at + Duration::minutes(TASK_EVENT_MINUTES), tz),
        all_day: false,
        recurrence: None,
    })
}

fn byday(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

/// This week's slot of a weekly event. Fixed events carry a weekly rule;
/// floating events are pushed only once confirmed, as a single occurrence.
pub fn encode_weekly_slot(event: &WeeklyEvent, today: NaiveDate, tz: Tz) -> Option<RemoteEvent> {
    let weekday = effective_weekday(event, today)?;
    let week = IsoWeekKey::of(today);
    let date = NaiveDate::from_isoywd_opt(week.year, week.week, weekday)?;
    let recurrence = match event.schedule {
        WeeklySchedule::Fixed { .. } => Some(format!("RRULE:FREQ=WEEKLY;BYDAY={}", byday(weekday))),
        WeeklySchedule::Floating { .. } => None,
    };

    let (start, end, all_day) = match event.time_start {
        Some(time_start) => {
            let start = resolve_local(&tz, date.and_time(time_start))?.with_timezone(&Utc);
            let end = match event.time_end {
                Some(time_end) => resolve_local(&tz, date.and_time(time_end))?.with_timezone(&Utc),
                None => start + Duration::minutes(DEFAULT_SLOT_MINUTES),
            };
            (format_local(start, tz), format_local(end, tz), false)
        }
        None => (
            date.format(ALL_DAY_FORMAT).to_string(),
            date.succ_opt()?.format(ALL_DAY_FORMAT).to_string(),
            true,
        ),
    };

    Some(RemoteEvent {
        uid: synthetic_uid(SyntheticKind::Slot, event.id),
        title: event.title.clone(),
        description: None,
        location: None,
        start,
        end,
        all_day,
        recurrence,
    })
}

/// Locally authored mirror row; keeps a UID it was already given.
pub fn encode_mirror_row(row: &CalendarEvent, tz: Tz) -> Option<RemoteEvent> {
    let id = row.id?;
    let uid = row
        .remote_uid
        .clone()
        .unwrap_or_else(|| synthetic_uid(SyntheticKind::Event, id));
    let (start, end) = if row.all_day {
        (format_all_day(row.start_at, tz), format_all_day(row.end_at, tz))
    } else {
        (format_local(row.start_at, tz), format_local(row.end_at, tz))
    };
    Some(RemoteEvent {
        uid,
        title: row.title.clone(),
        description: non_empty(row.description.as_deref()),
        location: non_empty(row.location.as_deref()),
        start,
        end,
        all_day: row.all_day,
        recurrence: row.recurrence.clone(),
    })
}

fn same_instant(left: &str, right: &str, all_day: bool) -> bool {
    if all_day {
        return left.trim() == right.trim();
    }
    match (
        DateTime::parse_from_rfc3339(left.trim()),
        DateTime::parse_from_rfc3339(right.trim()),
    ) {
        (Ok(left), Ok(right)) => left == right,
        _ => left.trim() == right.trim(),
    }
}

/// Compares what a push would overwrite. Times are compared as instants so a
/// different offset spelling is not a change.
pub fn remote_content_differs(current: &RemoteEvent, desired: &RemoteEvent) -> bool {
    current.title != desired.title
        || non_empty(current.description.as_deref()) != non_empty(desired.description.as_deref())
        || non_empty(current.location.as_deref()) != non_empty(desired.location.as_deref())
        || current.all_day != desired.all_day
        || !same_instant(&current.start, &desired.start, desired.all_day)
        || !same_instant(&current.end, &desired.end, desired.all_day)
        || current.recurrence != desired.recurrence
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{FloatingConfirmation, Priority};

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn berlin() -> Tz {
        "Europe/Berlin".parse().expect("valid tz")
    }

    fn remote(uid: &str, start: &str, end: &str, all_day: bool) -> RemoteEvent {
        RemoteEvent {
            uid: uid.to_string(),
            title: "Parents evening".to_string(),
            description: Some("Room 4".to_string()),
            location: None,
            start: start.to_string(),
            end: end.to_string(),
            all_day,
            recurrence: None,
        }
    }

    fn weekly(schedule: WeeklySchedule) -> WeeklyEvent {
        WeeklyEvent {
            id: 7,
            recipient: "chat-1".to_string(),
            title: "Piano lesson".to_string(),
            schedule,
            time_start: NaiveTime::from_hms_opt(16, 30, 0),
            time_end: None,
            reminder_lead_minutes: None,
            last_reminded_on: None,
        }
    }

    #[test]
    fn synthetic_uids_are_stable_and_recognised() {
        assert_eq!(synthetic_uid(SyntheticKind::Task, 42), "tmtask000042");
        assert_eq!(synthetic_uid(SyntheticKind::Slot, 7), "tmslot000007");
        assert_eq!(synthetic_uid(SyntheticKind::Event, 3), "tmevent000003");
        assert!(is_projection_uid("tmtask000042"));
        assert!(is_projection_uid("tmslot000007"));
        assert!(!is_projection_uid("tmevent000003"));
        assert!(!is_projection_uid("tmtask"));
        assert!(!is_projection_uid("abc"));
    }

    #[test]
    fn wire_all_day_and_cancelled_events() {
        let wire: GoogleCalendarEvent = serde_json::from_value(serde_json::json!({
            "id": "abc",
            "status": "confirmed",
            "summary": "Sports day",
            "start": { "date": "2024-06-07" },
            "end": { "date": "2024-06-08" },
            "recurrence": ["RRULE:FREQ=YEARLY"]
        }))
        .expect("wire event");
        let event = from_wire(wire.clone()).expect("confirmed event");
        assert!(event.all_day);
        assert_eq!(event.start, "2024-06-07");
        assert_eq!(event.recurrence.as_deref(), Some("RRULE:FREQ=YEARLY"));
        assert_eq!(to_wire(&event, None).start.date.as_deref(), Some("2024-06-07"));

        let mut cancelled = wire;
        cancelled.status = Some("cancelled".to_string());
        assert!(from_wire(cancelled).is_none());
    }

    #[test]
    fn decode_all_day_uses_local_midnight() {
        let decoded = decode_remote_event(
            &remote("abc", "2024-06-07", "2024-06-08", true),
            berlin(),
            fixed_time("2024-06-01T00:00:00Z"),
        )
        .expect("decode");
        assert_eq!(decoded.start_at, fixed_time("2024-06-06T22:00:00Z"));
        assert_eq!(decoded.end_at, fixed_time("2024-06-07T22:00:00Z"));
        assert_eq!(decoded.last_synced_at, Some(fixed_time("2024-06-01T00:00:00Z")));
        assert!(!decoded.shared);
    }

    #[test]
    fn decode_rejects_missing_uid_bad_times_and_inverted_range() {
        let synced = fixed_time("2024-06-01T00:00:00Z");
        let no_uid = remote("", "2024-06-07T10:00:00Z", "2024-06-07T11:00:00Z", false);
        let bad_start = remote("a", "tomorrow", "2024-06-07T11:00:00Z", false);
        let inverted = remote("a", "2024-06-07T12:00:00Z", "2024-06-07T11:00:00Z", false);
        for event in [no_uid, bad_start, inverted] {
            assert!(decode_remote_event(&event, berlin(), synced).is_err());
        }
    }

    #[test]
    fn task_projection_uses_local_offset() {
        let task = Task {
            id: 42,
            recipient: "chat-1".to_string(),
            title: "Renew passport".to_string(),
            description: None,
            priority: Priority::High,
            done: false,
            due_at: Some(fixed_time("2024-06-03T08:00:00Z")),
            repeat: None,
            remind_before_minutes: None,
            due_reminder_sent: false,
            series_advanced: false,
            reminder_count: 0,
            last_reminded_at: None,
            snooze_until: None,
            created_at: fixed_time("2024-06-01T08:00:00Z"),
        };
        let event = encode_task(&task, berlin()).expect("task with due date");
        assert_eq!(event.uid, "tmtask000042");
        assert_eq!(event.start, "2024-06-03T10:00:00+02:00");
        assert_eq!(event.end, "2024-06-03T10:30:00+02:00");
    }

    #[test]
    fn weekly_slots_follow_schedule_state() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 3).expect("monday");
        let wednesday = weekly(WeeklySchedule::Fixed { day: Weekday::Wed });
        let fixed = encode_weekly_slot(&wednesday, today, berlin()).expect("fixed slot");
        assert_eq!(fixed.start, "2024-06-05T16:30:00+02:00");
        assert_eq!(fixed.end, "2024-06-05T17:30:00+02:00");
        assert_eq!(fixed.recurrence.as_deref(), Some("RRULE:FREQ=WEEKLY;BYDAY=WE"));

        let unconfirmed = weekly(WeeklySchedule::Floating {
            candidates: vec![Weekday::Sat, Weekday::Sun],
            confirmation: None,
        });
        assert!(encode_weekly_slot(&unconfirmed, today, berlin()).is_none());

        let confirmed = weekly(WeeklySchedule::Floating {
            candidates: vec![Weekday::Sat, Weekday::Sun],
            confirmation: Some(FloatingConfirmation {
                day: Weekday::Sun,
                week: IsoWeekKey::of(today),
            }),
        });
        let slot = encode_weekly_slot(&confirmed, today, berlin()).expect("confirmed slot");
        assert_eq!(slot.start, "2024-06-09T16:30:00+02:00");
        assert!(slot.recurrence.is_none());
    }

    #[test]
    fn content_comparison_ignores_offset_spelling() {
        let current = remote("abc", "2024-06-07T08:00:00Z", "2024-06-07T09:00:00Z", false);
        let mut desired = remote(
            "abc",
            "2024-06-07T10:00:00+02:00",
            "2024-06-07T11:00:00+02:00",
            false,
        );
        assert!(!remote_content_differs(&current, &desired));
        desired.title = "Parents evening (moved)".to_string();
        assert!(remote_content_differs(&current, &desired));
    }
}
