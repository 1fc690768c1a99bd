use crate::domain::models::{
    CalendarEvent, FloatingConfirmation, IsoWeekKey, Priority, Reminder, Task, WeeklyEvent,
    WeeklySchedule,
};
use crate::domain::recurrence::{RepeatKind, RepeatRule};
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Anchor key used when a repeat rule carries no (valid) time of day.
pub const DEFAULT_TRIGGER_ANCHOR: &str = "09:00";

/// Persistence seam for everything the scheduler reads and marks.
///
/// Implementations must make each mutation atomic for the row it touches;
/// the scheduler does no locking of its own.
pub trait RuleStore: Send + Sync {
    fn insert_reminder(&self, reminder: &Reminder) -> Result<Reminder, InfraError>;
    fn due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<Reminder>, InfraError>;
    fn mark_reminder_fired(
        &self,
        reminder_id: i64,
        fired_at: DateTime<Utc>,
    ) -> Result<(), InfraError>;
    /// Moves a repeating reminder to its next instant, storing `repeat` as
    /// its rule, and clears the fired marker.
    fn reschedule_reminder(
        &self,
        reminder_id: i64,
        next_at: DateTime<Utc>,
        repeat: &RepeatRule,
    ) -> Result<(), InfraError>;

    fn insert_task(&self, task: &Task) -> Result<Task, InfraError>;
    fn get_task(&self, task_id: i64) -> Result<Option<Task>, InfraError>;
    fn open_tasks(&self) -> Result<Vec<Task>, InfraError>;
    fn tasks_with_due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<Task>, InfraError>;
    fn mark_task_reminder_sent(&self, task_id: i64) -> Result<(), InfraError>;
    /// Urgent, not done, and not snoozed past `now`.
    fn urgent_open_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, InfraError>;
    fn record_escalation(
        &self,
        task_id: i64,
        reminder_count: u32,
        reminded_at: DateTime<Utc>,
    ) -> Result<(), InfraError>;
    /// Repeating tasks whose trigger anchor equals `anchor_hhmm` and whose
    /// series has not advanced past them yet.
    fn repeating_tasks_at(&self, anchor_hhmm: &str) -> Result<Vec<Task>, InfraError>;
    /// Inserts the follow-up row carrying `repeat` and marks `task_id` as
    /// advanced, atomically.
    fn create_next_occurrence(
        &self,
        task_id: i64,
        next_due_at: DateTime<Utc>,
        repeat: &RepeatRule,
        created_at: DateTime<Utc>,
    ) -> Result<Task, InfraError>;
    /// Marks a series as exhausted without creating a follow-up row.
    fn end_series(&self, task_id: i64) -> Result<(), InfraError>;

    fn insert_weekly_event(&self, event: &WeeklyEvent) -> Result<WeeklyEvent, InfraError>;
    fn get_weekly_event(&self, event_id: i64) -> Result<Option<WeeklyEvent>, InfraError>;
    fn weekly_events(&self) -> Result<Vec<WeeklyEvent>, InfraError>;
    fn weekly_events_with_reminders(&self) -> Result<Vec<WeeklyEvent>, InfraError>;
    fn mark_weekly_event_reminded(
        &self,
        event_id: i64,
        occurrence: NaiveDate,
    ) -> Result<(), InfraError>;
    fn floating_events_unconfirmed(&self, week: IsoWeekKey) -> Result<Vec<WeeklyEvent>, InfraError>;
    fn set_floating_confirmation(
        &self,
        event_id: i64,
        confirmation: Option<FloatingConfirmation>,
    ) -> Result<(), InfraError>;

    fn calendar_events(&self) -> Result<Vec<CalendarEvent>, InfraError>;
    /// Inserts when `event.id` is `None`, otherwise overwrites that row.
    fn upsert_calendar_event(&self, event: &CalendarEvent) -> Result<CalendarEvent, InfraError>;
    fn delete_calendar_event(&self, event_id: i64) -> Result<(), InfraError>;
    fn set_calendar_event_uid(&self, event_id: i64, remote_uid: &str) -> Result<(), InfraError>;
}

/// Anchor key a repeating rule triggers at.
pub fn trigger_anchor(rule: &RepeatRule) -> String {
    rule.anchor_hhmm()
        .unwrap_or_else(|| DEFAULT_TRIGGER_ANCHOR.to_string())
}

pub(crate) fn is_repeating(task: &Task) -> bool {
    task.repeat
        .as_ref()
        .is_some_and(|rule| rule.kind != RepeatKind::None)
}

pub(crate) fn follow_up_task(
    task: &Task,
    next_due_at: DateTime<Utc>,
    repeat: &RepeatRule,
    created_at: DateTime<Utc>,
) -> Task {
    Task {
        id: 0,
        done: false,
        due_at: Some(next_due_at),
        repeat: Some(repeat.clone()),
        due_reminder_sent: false,
        series_advanced: false,
        reminder_count: 0,
        last_reminded_at: None,
        snooze_until: None,
        created_at,
        ..task.clone()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    reminders: BTreeMap<i64, Reminder>,
    tasks: BTreeMap<i64, Task>,
    weekly_events: BTreeMap<i64, WeeklyEvent>,
    calendar_events: BTreeMap<i64, CalendarEvent>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    state: Mutex<MemoryState>,
}

impl InMemoryRuleStore {
    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, InfraError> {
        self.state
            .lock()
            .map_err(|error| InfraError::LockPoisoned(format!("rule store lock poisoned: {error}")))
    }
}

fn not_found(kind: &str, id: i64) -> InfraError {
    InfraError::NotFound(format!("{kind} {id}"))
}

impl RuleStore for InMemoryRuleStore {
    fn insert_reminder(&self, reminder: &Reminder) -> Result<Reminder, InfraError> {
        reminder.validate().map_err(InfraError::InvalidData)?;
        let mut state = self.lock()?;
        let id = state.allocate_id();
        let stored = Reminder {
            id,
            ..reminder.clone()
        };
        state.reminders.insert(id, stored.clone());
        Ok(stored)
    }

    fn due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<Reminder>, InfraError> {
        let state = self.lock()?;
        Ok(state
            .reminders
            .values()
            .filter(|reminder| reminder.fired_at.is_none() && reminder.remind_at <= now)
            .cloned()
            .collect())
    }

    fn mark_reminder_fired(
        &self,
        reminder_id: i64,
        fired_at: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        let reminder = state
            .reminders
            .get_mut(&reminder_id)
            .ok_or_else(|| not_found("reminder", reminder_id))?;
        reminder.fired_at = Some(fired_at);
        Ok(())
    }

    fn reschedule_reminder(
        &self,
        reminder_id: i64,
        next_at: DateTime<Utc>,
        repeat: &RepeatRule,
    ) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        let reminder = state
            .reminders
            .get_mut(&reminder_id)
            .ok_or_else(|| not_found("reminder", reminder_id))?;
        reminder.remind_at = next_at;
        reminder.repeat = Some(repeat.clone());
        reminder.fired_at = None;
        Ok(())
    }

    fn insert_task(&self, task: &Task) -> Result<Task, InfraError> {
        task.validate().map_err(InfraError::InvalidData)?;
        let mut state = self.lock()?;
        let id = state.allocate_id();
        let stored = Task {
            id,
            ..task.clone()
        };
        state.tasks.insert(id, stored.clone());
        Ok(stored)
    }

    fn get_task(&self, task_id: i64) -> Result<Option<Task>, InfraError> {
        Ok(self.lock()?.tasks.get(&task_id).cloned())
    }

    fn open_tasks(&self) -> Result<Vec<Task>, InfraError> {
        let state = self.lock()?;
        Ok(state.tasks.values().filter(|task| !task.done).cloned().collect())
    }

    fn tasks_with_due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<Task>, InfraError> {
        let state = self.lock()?;
        Ok(state
            .tasks
            .values()
            .filter(|task| {
                !task.done
                    && !task.due_reminder_sent
                    && task.due_reminder_at().is_some_and(|at| at <= now)
            })
            .cloned()
            .collect())
    }

    fn mark_task_reminder_sent(&self, task_id: i64) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| not_found("task", task_id))?;
        task.due_reminder_sent = true;
        Ok(())
    }

    fn urgent_open_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, InfraError> {
        let state = self.lock()?;
        Ok(state
            .tasks
            .values()
            .filter(|task| {
                task.priority == Priority::Urgent && !task.done && !task.is_snoozed_at(now)
            })
            .cloned()
            .collect())
    }

    fn record_escalation(
        &self,
        task_id: i64,
        reminder_count: u32,
        reminded_at: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| not_found("task", task_id))?;
        task.reminder_count = reminder_count;
        task.last_reminded_at = Some(reminded_at);
        Ok(())
    }

    fn repeating_tasks_at(&self, anchor_hhmm: &str) -> Result<Vec<Task>, InfraError> {
        let state = self.lock()?;
        Ok(state
            .tasks
            .values()
            .filter(|task| is_repeating(task) && !task.series_advanced)
            .filter(|task| {
                task.repeat
                    .as_ref()
                    .is_some_and(|rule| trigger_anchor(rule) == anchor_hhmm)
            })
            .cloned()
            .collect())
    }

    fn create_next_occurrence(
        &self,
        task_id: i64,
        next_due_at: DateTime<Utc>,
        repeat: &RepeatRule,
        created_at: DateTime<Utc>,
    ) -> Result<Task, InfraError> {
        let mut state = self.lock()?;
        let current = state
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| not_found("task", task_id))?;
        if current.series_advanced {
            return Err(InfraError::InvalidData(format!(
                "task {task_id} already has a next occurrence"
            )));
        }

        let id = state.allocate_id();
        let next = Task {
            id,
            ..follow_up_task(&current, next_due_at, repeat, created_at)
        };
        state.tasks.insert(id, next.clone());
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.series_advanced = true;
        }
        Ok(next)
    }

    fn end_series(&self, task_id: i64) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| not_found("task", task_id))?;
        task.series_advanced = true;
        Ok(())
    }

    fn insert_weekly_event(&self, event: &WeeklyEvent) -> Result<WeeklyEvent, InfraError> {
        event.validate().map_err(InfraError::InvalidData)?;
        let mut state = self.lock()?;
        let id = state.allocate_id();
        let stored = WeeklyEvent {
            id,
            ..event.clone()
        };
        state.weekly_events.insert(id, stored.clone());
        Ok(stored)
    }

    fn get_weekly_event(&self, event_id: i64) -> Result<Option<WeeklyEvent>, InfraError> {
        Ok(self.lock()?.weekly_events.get(&event_id).cloned())
    }

    fn weekly_events(&self) -> Result<Vec<WeeklyEvent>, InfraError> {
        Ok(self.lock()?.weekly_events.values().cloned().collect())
    }

    fn weekly_events_with_reminders(&self) -> Result<Vec<WeeklyEvent>, InfraError> {
        let state = self.lock()?;
        Ok(state
            .weekly_events
            .values()
            .filter(|event| event.reminder_lead_minutes.is_some() && event.time_start.is_some())
            .cloned()
            .collect())
    }

    fn mark_weekly_event_reminded(
        &self,
        event_id: i64,
        occurrence: NaiveDate,
    ) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        let event = state
            .weekly_events
            .get_mut(&event_id)
            .ok_or_else(|| not_found("weekly event", event_id))?;
        event.last_reminded_on = Some(occurrence);
        Ok(())
    }

    fn floating_events_unconfirmed(
        &self,
        week: IsoWeekKey,
    ) -> Result<Vec<WeeklyEvent>, InfraError> {
        let state = self.lock()?;
        Ok(state
            .weekly_events
            .values()
            .filter(|event| match &event.schedule {
                WeeklySchedule::Floating { confirmation, .. } => {
                    confirmation.is_none_or(|confirmation| confirmation.week != week)
                }
                WeeklySchedule::Fixed { .. } => false,
            })
            .cloned()
            .collect())
    }

    fn set_floating_confirmation(
        &self,
        event_id: i64,
        confirmation: Option<FloatingConfirmation>,
    ) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        let event = state
            .weekly_events
            .get_mut(&event_id)
            .ok_or_else(|| not_found("weekly event", event_id))?;
        match &mut event.schedule {
            WeeklySchedule::Floating {
                confirmation: stored,
                ..
            } => {
                *stored = confirmation;
                Ok(())
            }
            WeeklySchedule::Fixed { .. } => Err(InfraError::InvalidData(format!(
                "weekly event {event_id} is not floating"
            ))),
        }
    }

    fn calendar_events(&self) -> Result<Vec<CalendarEvent>, InfraError> {
        Ok(self.lock()?.calendar_events.values().cloned().collect())
    }

    fn upsert_calendar_event(&self, event: &CalendarEvent) -> Result<CalendarEvent, InfraError> {
        let mut state = self.lock()?;
        let id = match event.id {
            Some(id) if state.calendar_events.contains_key(&id) => id,
            Some(id) => return Err(not_found("calendar event", id)),
            None => state.allocate_id(),
        };
        let stored = CalendarEvent {
            id: Some(id),
            ..event.clone()
        };
        state.calendar_events.insert(id, stored.clone());
        Ok(stored)
    }

    fn delete_calendar_event(&self, event_id: i64) -> Result<(), InfraError> {
        self.lock()?.calendar_events.remove(&event_id);
        Ok(())
    }

    fn set_calendar_event_uid(&self, event_id: i64, remote_uid: &str) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        let event = state
            .calendar_events
            .get_mut(&event_id)
            .ok_or_else(|| not_found("calendar event", event_id))?;
        event.remote_uid = Some(remote_uid.to_string());
        Ok(())
    }
}
