use crate::infrastructure::error::InfraError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn initialize_database(path: &Path) -> Result<(), InfraError> {
    let connection = open_connection(path)?;
    connection.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Connection shared by the scheduler and request paths; writers wait on a
/// busy database instead of failing immediately.
pub fn open_connection(path: &Path) -> Result<Connection, InfraError> {
    let connection = Connection::open(path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

/// Fixed-width UTC form so stored timestamps compare correctly as text.
pub fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn decode_timestamp(value: &str, field_name: &str) -> Result<DateTime<Utc>, InfraError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| {
            InfraError::InvalidData(format!("invalid {field_name} '{value}': {error}"))
        })
}

pub fn decode_optional_timestamp(
    value: Option<String>,
    field_name: &str,
) -> Result<Option<DateTime<Utc>>, InfraError> {
    value
        .as_deref()
        .map(|raw| decode_timestamp(raw, field_name))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_database_is_idempotent() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("taskmate.sqlite");
        initialize_database(&path).expect("first init");
        initialize_database(&path).expect("second init");

        let connection = open_connection(&path).expect("open");
        let tables: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('reminders', 'tasks', 'weekly_events', 'calendar_events')",
                [],
                |row| row.get(0),
            )
            .expect("count tables");
        assert_eq!(tables, 4);
    }

    #[test]
    fn encoded_timestamps_sort_chronologically() {
        let earlier = decode_timestamp("2024-06-03T09:00:00+02:00", "t").expect("parse");
        let later = decode_timestamp("2024-06-03T08:00:00Z", "t").expect("parse");
        assert!(encode_timestamp(earlier) < encode_timestamp(later));
        assert_eq!(encode_timestamp(later), "2024-06-03T08:00:00Z");
    }
}
