use crate::domain::models::{CalendarEvent, RemoteEvent};
use crate::infrastructure::calendar_transport::RemoteCalendarTransport;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::{
    decode_remote_event, encode_mirror_row, encode_task, encode_weekly_slot, is_projection_uid,
    remote_content_differs,
};
use crate::infrastructure::rule_store::RuleStore;
use chrono::{DateTime, Months, Utc};
use chrono_tz::Tz;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Duration as TokioDuration, sleep, timeout};
use tracing::{debug, info, warn};

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.deleted == 0 && self.errors.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Calendar pull: {} added, {} updated, {} deleted, {} errors",
            self.added,
            self.updated,
            self.deleted,
            self.errors.len()
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub errors: Vec<String>,
}

impl PushReport {
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.errors.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Calendar push: {} created, {} updated, {} unchanged, {} errors",
            self.created,
            self.updated,
            self.unchanged,
            self.errors.len()
        )
    }
}

/// Local entity pushed to the remote calendar.
struct Projection {
    event: RemoteEvent,
    /// Mirror row that still has to learn its UID.
    assign_uid_to: Option<i64>,
}

/// Two-way reconciliation between the remote calendar and the local mirror.
///
/// Pull treats the remote as the source of truth for rows it has seen
/// before; rows that were never synced are left alone. Push projects local
/// tasks, weekly slots and locally authored mirror rows under synthetic UIDs.
pub struct CalendarSyncService<T: ?Sized, S: ?Sized> {
    transport: Arc<T>,
    store: Arc<S>,
    calendar_path: String,
    timezone: Tz,
    window_months: u32,
    call_timeout: Duration,
    retry_policy: RetryPolicy,
    now_provider: NowProvider,
}

impl<T, S> CalendarSyncService<T, S>
where
    T: RemoteCalendarTransport + ?Sized,
    S: RuleStore + ?Sized,
{
    pub fn new(
        transport: Arc<T>,
        store: Arc<S>,
        calendar_path: impl Into<String>,
        timezone: Tz,
        window_months: u32,
    ) -> Self {
        Self {
            transport,
            store,
            calendar_path: calendar_path.into(),
            timezone,
            window_months: window_months.max(1),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub async fn sync_from_remote(&self) -> Result<SyncReport, InfraError> {
        let now = (self.now_provider)();
        let window_end = now
            .checked_add_months(Months::new(self.window_months))
            .unwrap_or(now);
        let remote_events = self.list_events_with_retry(now, window_end).await?;
        let local_rows = self.store.calendar_events()?;

        let mut by_uid: HashMap<String, CalendarEvent> = local_rows
            .iter()
            .filter_map(|row| row.remote_uid.clone().map(|uid| (uid, row.clone())))
            .collect();
        let mut seen = HashSet::new();
        let mut report = SyncReport::default();

        for remote in remote_events {
            let uid = remote.uid.trim().to_string();
            if !uid.is_empty() {
                seen.insert(uid.clone());
            }
            if is_projection_uid(&uid) {
                continue;
            }

            let incoming = match decode_remote_event(&remote, self.timezone, now) {
                Ok(incoming) => incoming,
                Err(error) => {
                    warn!(uid = %uid, %error, "skipping remote event");
                    report.errors.push(format!("{}: {error}", display_uid(&uid, &remote.title)));
                    continue;
                }
            };

            match by_uid.get(&uid) {
                None => match self.store.upsert_calendar_event(&incoming) {
                    Ok(stored) => {
                        debug!(uid = %uid, "mirrored new remote event");
                        report.added += 1;
                        by_uid.insert(uid, stored);
                    }
                    Err(error) => report.errors.push(format!("{uid}: {error}")),
                },
                Some(existing) if existing.content_differs(&incoming) => {
                    let overwrite = CalendarEvent {
                        id: existing.id,
                        shared: existing.shared,
                        ..incoming
                    };
                    match self.store.upsert_calendar_event(&overwrite) {
                        Ok(stored) => {
                            debug!(uid = %uid, "updated mirror row from remote");
                            report.updated += 1;
                            by_uid.insert(uid, stored);
                        }
                        Err(error) => report.errors.push(format!("{uid}: {error}")),
                    }
                }
                Some(_) => {}
            }
        }

        for row in &local_rows {
            let (Some(id), Some(uid)) = (row.id, row.remote_uid.as_deref()) else {
                continue;
            };
            if seen.contains(uid) || row.is_local_only() {
                continue;
            }
            match self.store.delete_calendar_event(id) {
                Ok(()) => {
                    debug!(uid, "removed mirror row deleted remotely");
                    report.deleted += 1;
                }
                Err(error) => report.errors.push(format!("{uid}: {error}")),
            }
        }

        info!(
            added = report.added,
            updated = report.updated,
            deleted = report.deleted,
            errors = report.errors.len(),
            "calendar pull finished"
        );
        Ok(report)
    }

    pub async fn sync_to_remote(&self) -> Result<PushReport, InfraError> {
        let now = (self.now_provider)();
        let window = Months::new(self.window_months);
        let window_start = now.checked_sub_months(window).unwrap_or(now);
        let window_end = now.checked_add_months(window).unwrap_or(now);

        let projections = self.projections(now, window_start, window_end)?;
        let remote: HashMap<String, RemoteEvent> = self
            .list_events_with_retry(window_start, window_end)
            .await?
            .into_iter()
            .map(|event| (event.uid.clone(), event))
            .collect();

        let mut report = PushReport::default();
        for projection in projections {
            let uid = projection.event.uid.clone();
            let pushed = match remote.get(&uid) {
                Some(current) if !remote_content_differs(current, &projection.event) => {
                    report.unchanged += 1;
                    Ok(())
                }
                Some(_) => self.update(&projection.event).await.map(|()| report.updated += 1),
                None => match self.create(&projection.event).await {
                    Ok(()) => {
                        report.created += 1;
                        Ok(())
                    }
                    Err(InfraError::Conflict(_)) => {
                        debug!(uid = %uid, "event exists outside listed window; updating");
                        self.update(&projection.event).await.map(|()| report.updated += 1)
                    }
                    Err(error) => Err(error),
                },
            };

            let assigned = pushed.and_then(|()| match projection.assign_uid_to {
                Some(row_id) => self.store.set_calendar_event_uid(row_id, &uid),
                None => Ok(()),
            });
            if let Err(error) = assigned {
                warn!(uid = %uid, %error, "calendar push failed");
                report.errors.push(format!("{uid}: {error}"));
            }
        }

        info!(
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            errors = report.errors.len(),
            "calendar push finished"
        );
        Ok(report)
    }

    /// Local entities the listing of `[from, to)` can see.
    fn projections(
        &self,
        now: DateTime<Utc>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Projection>, InfraError> {
        let today = now.with_timezone(&self.timezone).date_naive();
        let mut projections = Vec::new();

        for task in self.store.open_tasks()? {
            if !task.due_at.is_some_and(|due_at| from <= due_at && due_at < to) {
                debug!(task_id = task.id, "task outside the sync window; not pushed");
                continue;
            }
            if let Some(event) = encode_task(&task, self.timezone) {
                projections.push(Projection {
                    event,
                    assign_uid_to: None,
                });
            }
        }
        for weekly in self.store.weekly_events()? {
            if let Some(event) = encode_weekly_slot(&weekly, today, self.timezone) {
                projections.push(Projection {
                    event,
                    assign_uid_to: None,
                });
            }
        }
        for row in self.store.calendar_events()? {
            if !row.is_local_only() || row.start_at >= to || row.end_at <= from {
                continue;
            }
            if let Some(event) = encode_mirror_row(&row, self.timezone) {
                projections.push(Projection {
                    event,
                    assign_uid_to: row.id.filter(|_| row.remote_uid.is_none()),
                });
            }
        }
        Ok(projections)
    }

    async fn create(&self, event: &RemoteEvent) -> Result<(), InfraError> {
        self.call("create_event", self.transport.create_event(&self.calendar_path, event))
            .await
    }

    async fn update(&self, event: &RemoteEvent) -> Result<(), InfraError> {
        self.call("update_event", self.transport.update_event(&self.calendar_path, event))
            .await
    }

    async fn call<R>(
        &self,
        operation: &str,
        future: impl Future<Output = Result<R, InfraError>>,
    ) -> Result<R, InfraError> {
        match timeout(self.call_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(InfraError::Timeout {
                operation: operation.to_string(),
                seconds: self.call_timeout.as_secs(),
            }),
        }
    }

    async fn list_events_with_retry(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RemoteEvent>, InfraError> {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u8 = 0;

        loop {
            let listed = self
                .call("list_events", self.transport.list_events(&self.calendar_path, from, to))
                .await;
            match listed {
                Ok(events) => return Ok(events),
                Err(error) if error.is_transient() && attempt + 1 < max_attempts => {
                    let delay = self
                        .retry_policy
                        .base_delay_ms
                        .saturating_mul(2u64.saturating_pow(attempt as u32));
                    warn!(
                        %error,
                        attempt,
                        delay_ms = delay,
                        "listing calendar events failed; retrying"
                    );
                    sleep(TokioDuration::from_millis(delay)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

fn display_uid<'a>(uid: &'a str, title: &'a str) -> &'a str {
    if uid.is_empty() { title } else { uid }
}
