//! Weekly confirmation of floating events.
//!
//! A confirmation only holds for the ISO week it names; once the calendar
//! moves into another week the event needs confirming again.

use crate::domain::models::{
    FloatingConfirmation, IsoWeekKey, WeeklyEvent, WeeklySchedule, weekday_name,
};
use chrono::{NaiveDate, Weekday};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatingState {
    Unconfirmed,
    ConfirmedForWeek { day: Weekday, week: IsoWeekKey },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FloatingError {
    #[error("weekly event {0} not found")]
    NotFound(i64),
    #[error("weekly event {0} has a fixed day")]
    NotFloating(i64),
    #[error("{day} is not one of the days allowed for weekly event {event_id}")]
    DayNotAdmissible { event_id: i64, day: &'static str },
    #[error("storage error: {0}")]
    Store(String),
}

/// State of `event` as seen on `today`. Fixed events report `None`.
pub fn state_on(event: &WeeklyEvent, today: NaiveDate) -> Option<FloatingState> {
    state_in(event, IsoWeekKey::of(today))
}

pub fn state_in(event: &WeeklyEvent, week: IsoWeekKey) -> Option<FloatingState> {
    let WeeklySchedule::Floating { confirmation, .. } = &event.schedule else {
        return None;
    };
    Some(match confirmation {
        Some(confirmation) if confirmation.week == week => FloatingState::ConfirmedForWeek {
            day: confirmation.day,
            week: confirmation.week,
        },
        _ => FloatingState::Unconfirmed,
    })
}

pub fn needs_confirmation(event: &WeeklyEvent, week: IsoWeekKey) -> bool {
    matches!(state_in(event, week), Some(FloatingState::Unconfirmed))
}

/// Week a nudge sent on `today` asks about: the one containing tomorrow.
/// A nudge on the last day of a week therefore plans the coming week.
pub fn nudge_week(today: NaiveDate) -> IsoWeekKey {
    IsoWeekKey::of(today.succ_opt().unwrap_or(today))
}

/// Weekday the event happens on in `today`'s week, if known.
pub fn effective_weekday(event: &WeeklyEvent, today: NaiveDate) -> Option<Weekday> {
    match &event.schedule {
        WeeklySchedule::Fixed { day } => Some(*day),
        WeeklySchedule::Floating { .. } => match state_on(event, today)? {
            FloatingState::ConfirmedForWeek { day, .. } => Some(day),
            FloatingState::Unconfirmed => None,
        },
    }
}

/// Validates a user's choice for `week` and returns the confirmation to
/// persist.
pub fn confirm(
    event: &WeeklyEvent,
    day: Weekday,
    week: IsoWeekKey,
) -> Result<FloatingConfirmation, FloatingError> {
    let WeeklySchedule::Floating { candidates, .. } = &event.schedule else {
        return Err(FloatingError::NotFloating(event.id));
    };
    if !candidates.contains(&day) {
        return Err(FloatingError::DayNotAdmissible {
            event_id: event.id,
            day: weekday_name(day),
        });
    }
    Ok(FloatingConfirmation { day, week })
}

pub fn candidates(event: &WeeklyEvent) -> &[Weekday] {
    match &event.schedule {
        WeeklySchedule::Floating { candidates, .. } => candidates,
        WeeklySchedule::Fixed { .. } => &[],
    }
}
