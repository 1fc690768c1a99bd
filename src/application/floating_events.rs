use crate::domain::floating::{FloatingError, candidates, confirm, needs_confirmation, nudge_week};
use crate::domain::models::{
    FloatingConfirmation, IsoWeekKey, NotificationAction, WeeklyEvent, weekday_from_index,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::rule_store::RuleStore;
use chrono::{NaiveDate, Weekday};
use std::sync::Arc;
use tracing::info;

const CONFIRM_PREFIX: &str = "weekly:confirm:";

/// One weekly "which day?" prompt for `week`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloatingNudge {
    pub event_id: i64,
    pub week: IsoWeekKey,
    pub recipient: String,
    pub text: String,
    pub actions: Vec<NotificationAction>,
}

pub struct FloatingEventService<S: RuleStore + ?Sized> {
    store: Arc<S>,
}

fn store_error(error: InfraError) -> FloatingError {
    FloatingError::Store(error.to_string())
}

impl<S: RuleStore + ?Sized> FloatingEventService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    fn load(&self, event_id: i64) -> Result<WeeklyEvent, FloatingError> {
        self.store
            .get_weekly_event(event_id)
            .map_err(store_error)?
            .ok_or(FloatingError::NotFound(event_id))
    }

    /// Pins `event_id` to `day` for `week`.
    pub fn confirm_day(
        &self,
        event_id: i64,
        day: Weekday,
        week: IsoWeekKey,
    ) -> Result<FloatingConfirmation, FloatingError> {
        let event = self.load(event_id)?;
        let confirmation = confirm(&event, day, week)?;
        self.store
            .set_floating_confirmation(event_id, Some(confirmation))
            .map_err(store_error)?;
        info!(event_id, day = %day, week = %confirmation.week, "floating event confirmed");
        Ok(confirmation)
    }

    pub fn clear_confirmation(&self, event_id: i64) -> Result<(), FloatingError> {
        let event = self.load(event_id)?;
        if !event.is_floating() {
            return Err(FloatingError::NotFloating(event_id));
        }
        self.store
            .set_floating_confirmation(event_id, None)
            .map_err(store_error)
    }

    /// Floating events with no confirmation for `week`.
    pub fn pending(&self, week: IsoWeekKey) -> Result<Vec<WeeklyEvent>, FloatingError> {
        let events = self
            .store
            .floating_events_unconfirmed(week)
            .map_err(store_error)?;
        Ok(events
            .into_iter()
            .filter(|event| needs_confirmation(event, week))
            .collect())
    }

    /// Prompts sent on `today`. They ask about the week containing tomorrow,
    /// so a Sunday evening nudge plans the coming week.
    pub fn nudges(&self, today: NaiveDate) -> Result<Vec<FloatingNudge>, FloatingError> {
        let week = nudge_week(today);
        let this_week = week == IsoWeekKey::of(today);
        Ok(self
            .pending(week)?
            .iter()
            .map(|event| nudge_for(event, week, this_week))
            .collect())
    }

    /// Applies a `weekly:confirm:<id>:<day>:<week>` action. Data without a
    /// week confirms for `today`'s week. Returns `Ok(None)` for action data
    /// that belongs to something else.
    pub fn handle_action(
        &self,
        data: &str,
        today: NaiveDate,
    ) -> Result<Option<FloatingConfirmation>, FloatingError> {
        match parse_confirm_action(data) {
            Some((event_id, day, week)) => {
                let week = week.unwrap_or_else(|| IsoWeekKey::of(today));
                self.confirm_day(event_id, day, week).map(Some)
            }
            None => Ok(None),
        }
    }
}

pub fn nudge_for(event: &WeeklyEvent, week: IsoWeekKey, this_week: bool) -> FloatingNudge {
    let when = if this_week { "this week" } else { "next week" };
    FloatingNudge {
        event_id: event.id,
        week,
        recipient: event.recipient.clone(),
        text: format!("Which day is \"{}\" {when}?", event.title),
        actions: candidates(event)
            .iter()
            .map(|day| NotificationAction::confirm_day(event.id, *day, week))
            .collect(),
    }
}

pub fn parse_confirm_action(data: &str) -> Option<(i64, Weekday, Option<IsoWeekKey>)> {
    let mut parts = data.strip_prefix(CONFIRM_PREFIX)?.splitn(3, ':');
    let event_id = parts.next()?.parse::<i64>().ok()?;
    let day = weekday_from_index(parts.next()?.parse::<i64>().ok()?)?;
    let week = match parts.next() {
        Some(week) => Some(IsoWeekKey::parse(week)?),
        None => None,
    };
    Some((event_id, day, week))
}
