//! Next-occurrence arithmetic for repeating tasks and reminders.
//!
//! Everything here is pure: the reference instant is always passed in, and
//! the time zone travels with it.

use crate::domain::models::parse_hhmm;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_ANCHOR_HOUR: u32 = 9;
const MAX_CATCH_UP_STEPS: usize = 4096;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepeatKind {
    None,
    Daily,
    Weekdays,
    Weekly,
    Monthly,
    MonthlyWeekday,
}

/// Stored form of a repeat definition, kept as a JSON column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepeatRule {
    pub kind: RepeatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub week_of_month: Option<i64>,
    /// Day the monthly series was created on; kept so a clamped month does
    /// not shift later occurrences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u32>,
}

impl RepeatRule {
    pub fn new(kind: RepeatKind, time: Option<&str>) -> Self {
        Self {
            kind,
            time: time.map(ToOwned::to_owned),
            week_of_month: None,
            day_of_month: None,
        }
    }

    pub fn monthly_weekday(week_of_month: i64, time: Option<&str>) -> Self {
        Self {
            kind: RepeatKind::MonthlyWeekday,
            time: time.map(ToOwned::to_owned),
            week_of_month: Some(week_of_month),
            day_of_month: None,
        }
    }

    /// Copy of the rule with the monthly day fixed to `origin`'s, unless one
    /// is already recorded.
    pub fn pinned_to(&self, origin: NaiveDate) -> Self {
        let mut rule = self.clone();
        if rule.kind == RepeatKind::Monthly && rule.day_of_month.is_none() {
            rule.day_of_month = Some(origin.day());
        }
        rule
    }

    pub fn from_json(raw: &str) -> Result<Self, RecurrenceError> {
        serde_json::from_str(raw).map_err(|error| RecurrenceError::MalformedRule(error.to_string()))
    }

    pub fn to_json(&self) -> String {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| "{\"kind\":\"none\"}".to_string())
    }

    /// Normalized `HH:MM` anchor, if the stored time parses.
    pub fn anchor_hhmm(&self) -> Option<String> {
        self.time
            .as_deref()
            .and_then(parse_hhmm)
            .map(|time| time.format("%H:%M").to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecurrenceError {
    #[error("malformed repeat rule: {0}")]
    MalformedRule(String),
    #[error("invalid anchor time '{0}'")]
    InvalidAnchorTime(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    None,
    Daily,
    Weekdays,
    Weekly,
    MonthlySameDay { day: u32 },
    MonthlyNthWeekday { week: u8, weekday: Weekday },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatingObligation {
    pub recurrence: Recurrence,
    pub anchor: Option<NaiveTime>,
}

impl RepeatingObligation {
    /// Builds the typed obligation from its stored rule. `origin` is the local
    /// date of the occurrence the rule hangs off (the task's due date); it
    /// supplies the day-of-month and the weekday for the monthly kinds.
    pub fn from_rule(rule: &RepeatRule, origin: NaiveDate) -> Result<Self, RecurrenceError> {
        let anchor = match rule.time.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
            Some(raw) => Some(
                parse_hhmm(raw).ok_or_else(|| RecurrenceError::InvalidAnchorTime(raw.to_string()))?,
            ),
            None => None,
        };

        let recurrence = match rule.kind {
            RepeatKind::None => Recurrence::None,
            RepeatKind::Daily => Recurrence::Daily,
            RepeatKind::Weekdays => Recurrence::Weekdays,
            RepeatKind::Weekly => Recurrence::Weekly,
            RepeatKind::Monthly => Recurrence::MonthlySameDay {
                day: rule
                    .day_of_month
                    .filter(|day| (1..=31).contains(day))
                    .unwrap_or_else(|| origin.day()),
            },
            RepeatKind::MonthlyWeekday => Recurrence::MonthlyNthWeekday {
                week: clamp_week_of_month(rule.week_of_month.unwrap_or(1)),
                weekday: origin.weekday(),
            },
        };

        Ok(Self { recurrence, anchor })
    }

    pub fn anchor_time(&self) -> NaiveTime {
        self.anchor
            .or_else(|| NaiveTime::from_hms_opt(DEFAULT_ANCHOR_HOUR, 0, 0))
            .unwrap_or(NaiveTime::MIN)
    }
}

/// Weeks outside 1-4 collapse to the first week.
pub fn clamp_week_of_month(week: i64) -> u8 {
    match week {
        1..=4 => week as u8,
        _ => 1,
    }
}

/// Next occurrence strictly after `from`, in `from`'s time zone.
pub fn next_occurrence<Tz: TimeZone>(
    obligation: &RepeatingObligation,
    from: &DateTime<Tz>,
) -> Option<DateTime<Tz>> {
    let from_date = from.date_naive();
    let next_date = match obligation.recurrence {
        Recurrence::None => return None,
        Recurrence::Daily => from_date.succ_opt()?,
        Recurrence::Weekdays => {
            let mut date = from_date.succ_opt()?;
            while is_weekend(date.weekday()) {
                date = date.succ_opt()?;
            }
            date
        }
        Recurrence::Weekly => from_date.checked_add_signed(Duration::days(7))?,
        Recurrence::MonthlySameDay { day } => {
            let (year, month) = following_month(from_date.year(), from_date.month());
            let day = day.min(last_day_of_month(year, month)?);
            NaiveDate::from_ymd_opt(year, month, day)?
        }
        Recurrence::MonthlyNthWeekday { week, weekday } => {
            let (year, month) = following_month(from_date.year(), from_date.month());
            nth_weekday_of_month(year, month, weekday, week)?
        }
    };

    let candidate = resolve_local(&from.timezone(), next_date.and_time(obligation.anchor_time()))?;
    (candidate > *from).then_some(candidate)
}

/// First occurrence after `from` that is also strictly after `not_before`.
/// Used to keep a series moving past occurrences that fell into downtime.
pub fn next_occurrence_after<Tz: TimeZone>(
    obligation: &RepeatingObligation,
    from: &DateTime<Tz>,
    not_before: &DateTime<Tz>,
) -> Option<DateTime<Tz>> {
    let mut next = next_occurrence(obligation, from)?;
    for _ in 0..MAX_CATCH_UP_STEPS {
        if next > *not_before {
            return Some(next);
        }
        next = next_occurrence(obligation, &next)?;
    }
    None
}

/// The `week`-th `weekday` of the month; `week` outside 1-4 counts as 1.
pub fn nth_weekday_of_month(
    year: i32,
    month: u32,
    weekday: Weekday,
    week: u8,
) -> Option<NaiveDate> {
    let week = clamp_week_of_month(i64::from(week));
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let offset = (7 + weekday.num_days_from_monday() - first.weekday().num_days_from_monday()) % 7;
    first.checked_add_signed(Duration::days(i64::from(offset) + i64::from(week - 1) * 7))
}

pub fn last_day_of_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = following_month(year, month);
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?
        .pred_opt()
        .map(|date| date.day())
}

/// Local wall time to an instant: gaps move forward an hour, folds take the
/// earlier instant.
pub fn resolve_local<Tz: TimeZone>(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
}

pub fn is_weekend(weekday: Weekday) -> bool {
    matches!(weekday, Weekday::Sat | Weekday::Sun)
}

fn following_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 { (year + 1, 1) } else { (year, month + 1) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Timelike, Utc};
    use chrono_tz::Tz;
    use proptest::prelude::*;

    fn berlin() -> Tz {
        "Europe/Berlin".parse().expect("valid tz")
    }

    fn local(tz: &Tz, y: i32, m: u32, d: u32, hh: u32, mm: u32) -> DateTime<Tz> {
        tz.with_ymd_and_hms(y, m, d, hh, mm, 0).single().expect("unambiguous local time")
    }

    fn obligation(recurrence: Recurrence, anchor: Option<&str>) -> RepeatingObligation {
        RepeatingObligation {
            recurrence,
            anchor: anchor.and_then(parse_hhmm),
        }
    }

    fn all_kinds() -> Vec<Recurrence> {
        vec![
            Recurrence::Daily,
            Recurrence::Weekdays,
            Recurrence::Weekly,
            Recurrence::MonthlySameDay { day: 31 },
            Recurrence::MonthlySameDay { day: 15 },
            Recurrence::MonthlyNthWeekday { week: 2, weekday: Weekday::Fri },
            Recurrence::MonthlyNthWeekday { week: 4, weekday: Weekday::Sun },
        ]
    }

    #[test]
    fn weekly_scenario_advances_seven_days() {
        let tz = berlin();
        let from = local(&tz, 2024, 6, 3, 9, 0);
        let next = next_occurrence(&obligation(Recurrence::Weekly, Some("09:00")), &from)
            .expect("weekly has a next occurrence");
        assert_eq!(next, local(&tz, 2024, 6, 10, 9, 0));
    }

    #[test]
    fn second_friday_scenario_targets_following_month() {
        let tz = berlin();
        let from = local(&tz, 2024, 6, 1, 0, 0);
        let ob = obligation(
            Recurrence::MonthlyNthWeekday { week: 2, weekday: Weekday::Fri },
            None,
        );
        let next = next_occurrence(&ob, &from).expect("next exists");
        assert_eq!(next, local(&tz, 2024, 7, 12, 9, 0));
    }

    #[test]
    fn nth_weekday_never_retriggers_within_same_month() {
        let tz = berlin();
        // 2024-06-03 is before the second Friday of June, but the rule looks forward.
        let from = local(&tz, 2024, 6, 3, 8, 0);
        let ob = obligation(
            Recurrence::MonthlyNthWeekday { week: 2, weekday: Weekday::Fri },
            Some("18:30"),
        );
        let next = next_occurrence(&ob, &from).expect("next exists");
        assert_eq!(next, local(&tz, 2024, 7, 12, 18, 30));
    }

    #[test]
    fn week_of_month_outside_range_clamps_to_first() {
        assert_eq!(clamp_week_of_month(0), 1);
        assert_eq!(clamp_week_of_month(5), 1);
        assert_eq!(clamp_week_of_month(-3), 1);
        assert_eq!(clamp_week_of_month(4), 4);

        let rule = RepeatRule::monthly_weekday(7, Some("10:00"));
        let origin = NaiveDate::from_ymd_opt(2024, 6, 14).expect("valid date");
        let ob = RepeatingObligation::from_rule(&rule, origin).expect("rule parses");
        assert_eq!(
            ob.recurrence,
            Recurrence::MonthlyNthWeekday { week: 1, weekday: Weekday::Fri }
        );
    }

    #[test]
    fn monthly_same_day_clamps_to_last_day_without_drift() {
        let tz = berlin();
        let ob = obligation(Recurrence::MonthlySameDay { day: 31 }, Some("07:15"));

        let feb = next_occurrence(&ob, &local(&tz, 2024, 1, 31, 7, 15)).expect("february");
        assert_eq!(feb, local(&tz, 2024, 2, 29, 7, 15));

        let mar = next_occurrence(&ob, &feb).expect("march");
        assert_eq!(mar, local(&tz, 2024, 3, 31, 7, 15));

        let may = next_occurrence(&ob, &local(&tz, 2024, 4, 30, 7, 15)).expect("may");
        assert_eq!(may, local(&tz, 2024, 5, 31, 7, 15));

        let jun = next_occurrence(&ob, &may).expect("june");
        assert_eq!(jun, local(&tz, 2024, 6, 30, 7, 15));
    }

    #[test]
    fn pinned_monthly_rule_keeps_original_day_after_clamp() {
        let rule = RepeatRule::new(RepeatKind::Monthly, Some("07:15"))
            .pinned_to(NaiveDate::from_ymd_opt(2024, 1, 31).expect("valid date"));
        let clamped = NaiveDate::from_ymd_opt(2024, 2, 29).expect("valid date");
        let ob = RepeatingObligation::from_rule(&rule.pinned_to(clamped), clamped).expect("parses");
        assert_eq!(ob.recurrence, Recurrence::MonthlySameDay { day: 31 });

        let weekly = RepeatRule::new(RepeatKind::Weekly, None).pinned_to(clamped);
        assert_eq!(weekly.day_of_month, None);
    }

    #[test]
    fn monthly_same_day_wraps_year() {
        let tz = berlin();
        let ob = obligation(Recurrence::MonthlySameDay { day: 15 }, None);
        let next = next_occurrence(&ob, &local(&tz, 2024, 12, 15, 9, 0)).expect("january");
        assert_eq!(next, local(&tz, 2025, 1, 15, 9, 0));
    }

    #[test]
    fn weekdays_skip_the_weekend() {
        let tz = berlin();
        let ob = obligation(Recurrence::Weekdays, Some("08:00"));
        // Friday -> Monday
        let next = next_occurrence(&ob, &local(&tz, 2024, 6, 7, 8, 0)).expect("monday");
        assert_eq!(next, local(&tz, 2024, 6, 10, 8, 0));
        // Saturday -> Monday
        let next = next_occurrence(&ob, &local(&tz, 2024, 6, 8, 12, 0)).expect("monday");
        assert_eq!(next, local(&tz, 2024, 6, 10, 8, 0));
    }

    #[test]
    fn daily_uses_default_anchor_when_unset() {
        let tz = berlin();
        let ob = obligation(Recurrence::Daily, None);
        let next = next_occurrence(&ob, &local(&tz, 2024, 6, 3, 22, 45)).expect("next day");
        assert_eq!(next, local(&tz, 2024, 6, 4, 9, 0));
    }

    #[test]
    fn none_kind_has_no_next_occurrence() {
        let tz = berlin();
        let ob = obligation(Recurrence::None, Some("09:00"));
        assert!(next_occurrence(&ob, &local(&tz, 2024, 6, 3, 9, 0)).is_none());
    }

    #[test]
    fn dst_gap_moves_forward_one_hour() {
        let tz = berlin();
        // 2024-03-31 02:30 does not exist in Berlin.
        let ob = obligation(Recurrence::Daily, Some("02:30"));
        let next = next_occurrence(&ob, &local(&tz, 2024, 3, 30, 2, 30)).expect("next");
        assert_eq!(next.date_naive(), NaiveDate::from_ymd_opt(2024, 3, 31).expect("date"));
        assert_eq!(next.hour(), 3);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn malformed_anchor_is_reported() {
        let rule = RepeatRule::new(RepeatKind::Daily, Some("9h"));
        let origin = NaiveDate::from_ymd_opt(2024, 6, 3).expect("valid date");
        assert_eq!(
            RepeatingObligation::from_rule(&rule, origin),
            Err(RecurrenceError::InvalidAnchorTime("9h".to_string()))
        );
    }

    #[test]
    fn repeat_rule_json_roundtrip_and_rejects_unknown_kind() {
        let rule = RepeatRule::monthly_weekday(2, Some("09:30"));
        let parsed = RepeatRule::from_json(&rule.to_json()).expect("parse");
        assert_eq!(parsed, rule);
        assert!(RepeatRule::from_json("{\"kind\":\"yearly\"}").is_err());
        assert_eq!(
            RepeatRule::from_json("{\"kind\":\"daily\",\"time\":\"7:05\"}")
                .expect("parse")
                .anchor_hhmm()
                .as_deref(),
            Some("07:05")
        );
    }

    #[test]
    fn catch_up_skips_past_occurrences() {
        let tz = berlin();
        let ob = obligation(Recurrence::Daily, Some("09:00"));
        let from = local(&tz, 2024, 6, 1, 9, 0);
        let now = local(&tz, 2024, 6, 5, 12, 0);
        let next = next_occurrence_after(&ob, &from, &now).expect("next");
        assert_eq!(next, local(&tz, 2024, 6, 6, 9, 0));
    }

    fn any_instant() -> impl Strategy<Value = DateTime<Utc>> {
        // 2000-01-01 .. 2060-01-01
        (946_684_800i64..2_840_140_800i64)
            .prop_map(|secs| DateTime::<Utc>::from_timestamp(secs, 0).expect("in range"))
    }

    fn any_anchor() -> impl Strategy<Value = Option<NaiveTime>> {
        prop_oneof![
            Just(None),
            (0u32..24, 0u32..60).prop_map(|(h, m)| NaiveTime::from_hms_opt(h, m, 0)),
        ]
    }

    proptest! {
        #[test]
        fn next_occurrence_is_strictly_after_from(instant in any_instant(), anchor in any_anchor()) {
            let tz = berlin();
            let from = instant.with_timezone(&tz);
            for recurrence in all_kinds() {
                let ob = RepeatingObligation { recurrence, anchor };
                let next = next_occurrence(&ob, &from).expect("every kind but none has a next");
                prop_assert!(next > from, "{recurrence:?} produced {next} for {from}");
            }
        }

        #[test]
        fn weekdays_never_land_on_weekend(instant in any_instant(), anchor in any_anchor()) {
            let tz = berlin();
            let from = instant.with_timezone(&tz);
            let ob = RepeatingObligation { recurrence: Recurrence::Weekdays, anchor };
            let next = next_occurrence(&ob, &from).expect("next");
            prop_assert!(!is_weekend(next.weekday()));
        }

        #[test]
        fn second_friday_is_in_following_month_window(instant in any_instant()) {
            let from = instant.with_timezone(&Utc);
            let ob = RepeatingObligation {
                recurrence: Recurrence::MonthlyNthWeekday { week: 2, weekday: Weekday::Fri },
                anchor: None,
            };
            let next = next_occurrence(&ob, &from).expect("next");
            let (year, month) = following_month(from.year(), from.month());
            prop_assert_eq!((next.year(), next.month()), (year, month));
            prop_assert_eq!(next.weekday(), Weekday::Fri);
            prop_assert!((8..=14).contains(&next.day()));
        }
    }
}
