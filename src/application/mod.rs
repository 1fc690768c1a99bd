pub mod bootstrap;
pub mod calendar_sync;
pub mod dispatch;
pub mod floating_events;
pub mod reminders;
