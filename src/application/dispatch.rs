//! Minute-resolution dispatch loop.
//!
//! A `Scheduler` owns its collaborators and is moved into a single tokio
//! task by `start()`. Each tick re-queries the rule store, notifies, and only
//! then records the fired marker, so a failed send is retried on a later
//! tick and a failed marker can at worst produce a duplicate.

use crate::application::calendar_sync::{CalendarSyncService, NowProvider};
use crate::application::floating_events::FloatingEventService;
use crate::application::reminders::{
    DigestKind, build_digest, escalation_message, event_occurrence_due, event_reminder_message,
    is_escalation_due, next_reminder_instant, next_task_due, reminder_message,
    repeating_task_message, task_actions, task_due_message,
};
use crate::domain::models::{
    DueSignal, EntityKind, NotificationAction, Task, WeeklyEvent, format_hhmm,
};
use crate::infrastructure::calendar_transport::RemoteCalendarTransport;
use crate::infrastructure::config::SchedulerConfig;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::notifier::Notifier;
use crate::infrastructure::rule_store::RuleStore;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, DurationRound, Timelike, Utc};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, info, warn};

pub type SharedCalendarSync = CalendarSyncService<dyn RemoteCalendarTransport, dyn RuleStore>;

const TICK_PERIOD: Duration = Duration::from_secs(60);

/// What one tick (or one handler) did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fired: Vec<DueSignal>,
    pub failures: Vec<String>,
}

impl TickReport {
    pub fn merge(&mut self, other: TickReport) {
        self.fired.extend(other.fired);
        self.failures.extend(other.failures);
    }

    pub fn is_empty(&self) -> bool {
        self.fired.is_empty() && self.failures.is_empty()
    }

    fn fire(&mut self, entity_id: i64, kind: EntityKind, scheduled_at: DateTime<Utc>) {
        debug!(entity_id, kind = kind.as_str(), %scheduled_at, "fired");
        self.fired.push(DueSignal {
            entity_id,
            kind,
            scheduled_at,
        });
    }

    fn fail(&mut self, context: impl Display, error: impl Display) {
        warn!(%context, %error, "dispatch step failed");
        self.failures.push(format!("{context}: {error}"));
    }
}

pub struct Scheduler {
    store: Arc<dyn RuleStore>,
    notifier: Arc<dyn Notifier>,
    floating: FloatingEventService<dyn RuleStore>,
    calendar: Option<Arc<SharedCalendarSync>>,
    report_recipient: Option<String>,
    config: SchedulerConfig,
    now_provider: NowProvider,
    tick_period: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RuleStore>,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            floating: FloatingEventService::new(Arc::clone(&store)),
            store,
            notifier,
            calendar: None,
            report_recipient: None,
            config,
            now_provider: Arc::new(Utc::now),
            tick_period: TICK_PERIOD,
        }
    }

    /// Enables the periodic pull/push. Non-empty results are sent to
    /// `report_recipient` when one is given.
    pub fn with_calendar_sync(
        mut self,
        calendar: Arc<SharedCalendarSync>,
        report_recipient: Option<String>,
    ) -> Self {
        self.calendar = Some(calendar);
        self.report_recipient = report_recipient;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn with_tick_period(mut self, tick_period: Duration) -> Self {
        self.tick_period = tick_period;
        self
    }

    /// Moves the scheduler onto its own task. Must be called inside a tokio
    /// runtime.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let join = tokio::spawn(self.run(receiver));
        SchedulerHandle { shutdown, join }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let delay = delay_until_boundary((self.now_provider)(), self.tick_period);
        let mut ticker = interval_at(Instant::now() + delay, self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            timezone = %self.config.timezone,
            first_tick_in_ms = delay.as_millis() as u64,
            "scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let now = minute_of((self.now_provider)());
                    let report = self.run_tick(now).await;
                    if !report.is_empty() {
                        info!(
                            %now,
                            fired = report.fired.len(),
                            failures = report.failures.len(),
                            "tick finished"
                        );
                    }
                }
            }
        }
        info!("scheduler stopped");
    }

    /// Evaluates every cadence that is due at `now`.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> TickReport {
        let local = now.with_timezone(&self.config.timezone);
        let hhmm = format_hhmm(local.time());
        let mut report = TickReport::default();

        report.merge(self.dispatch_due_reminders(now).await);
        report.merge(self.dispatch_event_reminders(now).await);
        report.merge(self.dispatch_repeating_tasks(now).await);
        report.merge(self.dispatch_task_due_reminders(now).await);

        if local.minute() == 0 {
            report.merge(self.escalate_urgent_tasks(now).await);
        }
        if hhmm == format_hhmm(self.config.morning_digest) {
            report.merge(self.send_digests(DigestKind::Morning, now).await);
        }
        if hhmm == format_hhmm(self.config.evening_digest) {
            report.merge(self.send_digests(DigestKind::Evening, now).await);
        }
        if local.weekday() == self.config.nudge_day && hhmm == format_hhmm(self.config.nudge_time) {
            report.merge(self.send_floating_nudges(now).await);
        }
        let interval = i64::from(self.config.sync_interval_minutes);
        if self.calendar.is_some() && interval > 0 && (now.timestamp() / 60) % interval == 0 {
            report.merge(self.reconcile_calendar().await);
        }
        report
    }

    async fn notify(
        &self,
        recipient: &str,
        text: &str,
        actions: &[NotificationAction],
    ) -> Result<(), InfraError> {
        let send = async {
            if actions.is_empty() {
                self.notifier.send(recipient, text).await
            } else {
                self.notifier.send_with_actions(recipient, text, actions).await
            }
        };
        timeout(self.config.notifier_timeout, send)
            .await
            .map_err(|_| InfraError::Timeout {
                operation: format!("notify {recipient}"),
                seconds: self.config.notifier_timeout.as_secs(),
            })?
    }

    pub async fn dispatch_due_reminders(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let reminders = match self.store.due_reminders(now) {
            Ok(reminders) => reminders,
            Err(error) => {
                report.fail("load due reminders", error);
                return report;
            }
        };

        for reminder in reminders {
            let context = format!("reminder {}", reminder.id);
            let text = reminder_message(&reminder);
            if let Err(error) = self.notify(&reminder.recipient, &text, &[]).await {
                report.fail(context, error);
                continue;
            }
            report.fire(reminder.id, EntityKind::Reminder, reminder.remind_at);

            let next = next_reminder_instant(&reminder, self.config.timezone, now)
                .unwrap_or_else(|error| {
                    warn!(
                        reminder_id = reminder.id,
                        %error,
                        "repeat rule unusable; reminder will not repeat"
                    );
                    None
                });
            let marked = match next {
                Some((next_at, rule)) => {
                    debug!(reminder_id = reminder.id, %next_at, "reminder rescheduled");
                    self.store.reschedule_reminder(reminder.id, next_at, &rule)
                }
                None => self.store.mark_reminder_fired(reminder.id, now),
            };
            if let Err(error) = marked {
                report.fail(context, error);
            }
        }
        report
    }

    pub async fn dispatch_task_due_reminders(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let tasks = match self.store.tasks_with_due_reminders(now) {
            Ok(tasks) => tasks,
            Err(error) => {
                report.fail("load task due reminders", error);
                return report;
            }
        };

        for task in tasks {
            let context = format!("task {} due reminder", task.id);
            let text = task_due_message(&task, self.config.timezone);
            if let Err(error) = self.notify(&task.recipient, &text, &task_actions(task.id)).await {
                report.fail(context, error);
                continue;
            }
            report.fire(
                task.id,
                EntityKind::TaskDueReminder,
                task.due_reminder_at().unwrap_or(now),
            );
            if let Err(error) = self.store.mark_task_reminder_sent(task.id) {
                report.fail(context, error);
            }
        }
        report
    }

    /// Fires repeating tasks whose anchor is this minute and whose due date
    /// has arrived, then creates the series' next row.
    pub async fn dispatch_repeating_tasks(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let tz = self.config.timezone;
        let local_now = now.with_timezone(&tz);
        let tasks = match self.store.repeating_tasks_at(&format_hhmm(local_now.time())) {
            Ok(tasks) => tasks,
            Err(error) => {
                report.fail("load repeating tasks", error);
                return report;
            }
        };

        for task in tasks {
            let Some(due_at) = task.due_at else {
                continue;
            };
            if due_at.with_timezone(&tz).date_naive() > local_now.date_naive() {
                continue;
            }
            let context = format!("repeating task {}", task.id);

            if !task.done {
                if let Err(error) = self
                    .notify(&task.recipient, &repeating_task_message(&task), &task_actions(task.id))
                    .await
                {
                    report.fail(context, error);
                    continue;
                }
                report.fire(task.id, EntityKind::RepeatingTask, due_at);
            }

            let advanced = match next_task_due(&task, tz, now) {
                Ok(Some((next_due_at, rule))) => self
                    .store
                    .create_next_occurrence(task.id, next_due_at, &rule, now)
                    .map(|next| {
                        debug!(
                            task_id = task.id,
                            next_task_id = next.id,
                            %next_due_at,
                            "series advanced"
                        )
                    }),
                Ok(None) => self.store.end_series(task.id),
                Err(error) => {
                    warn!(task_id = task.id, %error, "repeat rule unusable; ending series");
                    self.store.end_series(task.id)
                }
            };
            if let Err(error) = advanced {
                report.fail(context, error);
            }
        }
        report
    }

    pub async fn dispatch_event_reminders(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let events = match self.store.weekly_events_with_reminders() {
            Ok(events) => events,
            Err(error) => {
                report.fail("load weekly events", error);
                return report;
            }
        };

        for event in events {
            let Some(occurrence) = event_occurrence_due(&event, now, self.config.timezone) else {
                continue;
            };
            let context = format!("weekly event {}", event.id);
            let text = event_reminder_message(&event, occurrence);
            if let Err(error) = self.notify(&event.recipient, &text, &[]).await {
                report.fail(context, error);
                continue;
            }
            report.fire(event.id, EntityKind::WeeklyEvent, now);
            if let Err(error) = self.store.mark_weekly_event_reminded(event.id, occurrence) {
                report.fail(context, error);
            }
        }
        report
    }

    /// Renotifies every urgent open task that is not snoozed.
    pub async fn escalate_urgent_tasks(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let tasks = match self.store.urgent_open_tasks(now) {
            Ok(tasks) => tasks,
            Err(error) => {
                report.fail("load urgent tasks", error);
                return report;
            }
        };

        for task in tasks.iter().filter(|task| is_escalation_due(task, now)) {
            let context = format!("urgent task {}", task.id);
            let count = task.reminder_count.saturating_add(1);
            if let Err(error) = self
                .notify(&task.recipient, &escalation_message(task, count), &task_actions(task.id))
                .await
            {
                report.fail(context, error);
                continue;
            }
            report.fire(task.id, EntityKind::UrgentTask, now);
            if let Err(error) = self.store.record_escalation(task.id, count, now) {
                report.fail(context, error);
            }
        }
        report
    }

    pub async fn send_digests(&self, kind: DigestKind, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let loaded = self
            .store
            .open_tasks()
            .and_then(|tasks| Ok((tasks, self.store.weekly_events()?)));
        let (tasks, events) = match loaded {
            Ok(loaded) => loaded,
            Err(error) => {
                report.fail("load digest data", error);
                return report;
            }
        };

        let mut by_recipient: BTreeMap<&str, (Vec<&Task>, Vec<&WeeklyEvent>)> = BTreeMap::new();
        for task in &tasks {
            by_recipient.entry(task.recipient.as_str()).or_default().0.push(task);
        }
        for event in &events {
            by_recipient.entry(event.recipient.as_str()).or_default().1.push(event);
        }

        for (recipient, (tasks, events)) in by_recipient {
            let Some(text) = build_digest(kind, &tasks, &events, now, self.config.timezone) else {
                continue;
            };
            if let Err(error) = self.notify(recipient, &text, &[]).await {
                report.fail(format!("{kind:?} digest for {recipient}"), error);
            }
        }
        report
    }

    pub async fn send_floating_nudges(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let today = now.with_timezone(&self.config.timezone).date_naive();
        let nudges = match self.floating.nudges(today) {
            Ok(nudges) => nudges,
            Err(error) => {
                report.fail("load floating events", error);
                return report;
            }
        };

        for nudge in nudges {
            if let Err(error) = self.notify(&nudge.recipient, &nudge.text, &nudge.actions).await {
                report.fail(format!("floating nudge {}", nudge.event_id), error);
            }
        }
        report
    }

    /// Pull then push. Item errors from either direction land in `failures`.
    pub async fn reconcile_calendar(&self) -> TickReport {
        let mut report = TickReport::default();
        let Some(calendar) = &self.calendar else {
            return report;
        };
        let mut summary = Vec::new();

        match calendar.sync_from_remote().await {
            Ok(pulled) => {
                if !pulled.is_noop() {
                    summary.push(pulled.summary());
                }
                for error in pulled.errors {
                    report.fail("calendar pull", error);
                }
            }
            Err(error) => report.fail("calendar pull", error),
        }
        match calendar.sync_to_remote().await {
            Ok(pushed) => {
                if !pushed.is_noop() {
                    summary.push(pushed.summary());
                }
                for error in pushed.errors {
                    report.fail("calendar push", error);
                }
            }
            Err(error) => report.fail("calendar push", error),
        }

        if summary.is_empty() {
            return report;
        }
        let text = summary.join("\n");
        info!(summary = %text, "calendar reconciled");
        if let Some(recipient) = &self.report_recipient {
            if let Err(error) = self.notify(recipient, &text, &[]).await {
                report.fail("calendar report", error);
            }
        }
        report
    }
}

/// Stops the loop; an in-flight tick finishes first.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn stop(self) -> Result<(), InfraError> {
        if self.shutdown.send(true).is_err() {
            debug!("scheduler loop already gone");
        }
        self.join.await.map_err(|error| {
            InfraError::Io(std::io::Error::other(format!("scheduler task failed: {error}")))
        })
    }
}

fn minute_of(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(ChronoDuration::minutes(1)).unwrap_or(now)
}

fn delay_until_boundary(now: DateTime<Utc>, period: Duration) -> Duration {
    let period_ms = i64::try_from(period.as_millis()).unwrap_or(i64::MAX).max(1);
    let elapsed = now.timestamp_millis().rem_euclid(period_ms);
    Duration::from_millis(u64::try_from(period_ms - elapsed).unwrap_or(0))
}
