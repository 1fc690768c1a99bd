pub mod calendar_transport;
pub mod config;
pub mod error;
pub mod event_mapper;
pub mod logging;
pub mod notifier;
pub mod rule_store;
pub mod sqlite_rule_store;
pub mod storage;
