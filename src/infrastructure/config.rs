use crate::domain::models::{parse_hhmm, parse_weekday, validate_hhmm};
use crate::infrastructure::error::InfraError;
use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

const APP_JSON: &str = "app.json";
const CALENDAR_JSON: &str = "calendar.json";
const SUPPORTED_SCHEMA: u64 = 1;
const DEFAULT_CALENDAR_BASE_URL: &str = "https://www.googleapis.com/calendar/v3/";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyNudgeConfig {
    pub day: String,
    pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    #[serde(default = "default_notifier_seconds")]
    pub notifier_seconds: u64,
    #[serde(default = "default_calendar_seconds")]
    pub calendar_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            notifier_seconds: default_notifier_seconds(),
            calendar_seconds: default_calendar_seconds(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotifierConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// `config/app.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub schema: u8,
    pub timezone: String,
    pub morning_digest: String,
    pub evening_digest: String,
    pub weekly_nudge: WeeklyNudgeConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// `config/calendar.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CalendarConfig {
    pub schema: u8,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_calendar_base_url")]
    pub base_url: String,
    pub path: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_sync_window_months")]
    pub sync_window_months: u32,
    /// 0 disables periodic reconciliation.
    #[serde(default = "default_sync_interval_minutes")]
    pub sync_interval_minutes: u32,
    #[serde(default)]
    pub report_recipient: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBundle {
    pub app: AppConfig,
    pub calendar: CalendarConfig,
}

/// Typed values the scheduler runs on, resolved once at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub timezone: Tz,
    pub morning_digest: NaiveTime,
    pub evening_digest: NaiveTime,
    pub nudge_day: Weekday,
    pub nudge_time: NaiveTime,
    pub sync_interval_minutes: u32,
    pub notifier_timeout: Duration,
    pub calendar_timeout: Duration,
}

fn default_notifier_seconds() -> u64 {
    10
}

fn default_calendar_seconds() -> u64 {
    30
}

fn default_calendar_base_url() -> String {
    DEFAULT_CALENDAR_BASE_URL.to_string()
}

fn default_sync_window_months() -> u32 {
    3
}

fn default_sync_interval_minutes() -> u32 {
    30
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "timezone": "UTC",
                "morningDigest": "08:00",
                "eveningDigest": "20:00",
                "weeklyNudge": { "day": "Sunday", "time": "18:00" },
                "notifier": { "webhookUrl": null },
                "timeouts": { "notifierSeconds": 10, "calendarSeconds": 30 }
            }),
        ),
        (
            CALENDAR_JSON,
            serde_json::json!({
                "schema": 1,
                "enabled": false,
                "baseUrl": DEFAULT_CALENDAR_BASE_URL,
                "path": "primary",
                "accessToken": null,
                "syncWindowMonths": 3,
                "syncIntervalMinutes": 30,
                "reportRecipient": null
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != SUPPORTED_SCHEMA {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

fn read_typed<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, InfraError> {
    let value = read_config(path)?;
    serde_json::from_value(value)
        .map_err(|error| InfraError::InvalidConfig(format!("{}: {error}", path.display())))
}

pub fn load_configs(config_dir: &Path) -> Result<ConfigBundle, InfraError> {
    let bundle = ConfigBundle {
        app: read_typed(&config_dir.join(APP_JSON))?,
        calendar: read_typed(&config_dir.join(CALENDAR_JSON))?,
    };
    bundle.app.validate()?;
    bundle.calendar.validate()?;
    Ok(bundle)
}

pub fn parse_timezone(value: &str) -> Result<Tz, InfraError> {
    value
        .trim()
        .parse::<Tz>()
        .map_err(|_| InfraError::InvalidConfig(format!("unknown timezone '{value}'")))
}

fn invalid(message: String) -> InfraError {
    InfraError::InvalidConfig(message)
}

fn config_time(value: &str, field_name: &str) -> Result<NaiveTime, InfraError> {
    validate_hhmm(value, field_name).map_err(invalid)?;
    parse_hhmm(value).ok_or_else(|| invalid(format!("{field_name} must be HH:MM")))
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), InfraError> {
        parse_timezone(&self.timezone)?;
        config_time(&self.morning_digest, "morningDigest")?;
        config_time(&self.evening_digest, "eveningDigest")?;
        config_time(&self.weekly_nudge.time, "weeklyNudge.time")?;
        self.nudge_day()?;
        if self.timeouts.notifier_seconds == 0 || self.timeouts.calendar_seconds == 0 {
            return Err(invalid("timeouts must be at least one second".to_string()));
        }
        if let Some(url) = self.notifier.webhook_url.as_deref() {
            url::Url::parse(url).map_err(|error| invalid(format!("notifier.webhookUrl: {error}")))?;
        }
        Ok(())
    }

    fn nudge_day(&self) -> Result<Weekday, InfraError> {
        let day = &self.weekly_nudge.day;
        parse_weekday(day)
            .ok_or_else(|| invalid(format!("weeklyNudge.day '{day}' is not a weekday")))
    }

    pub fn scheduler_config(
        &self,
        calendar: &CalendarConfig,
    ) -> Result<SchedulerConfig, InfraError> {
        Ok(SchedulerConfig {
            timezone: parse_timezone(&self.timezone)?,
            morning_digest: config_time(&self.morning_digest, "morningDigest")?,
            evening_digest: config_time(&self.evening_digest, "eveningDigest")?,
            nudge_day: self.nudge_day()?,
            nudge_time: config_time(&self.weekly_nudge.time, "weeklyNudge.time")?,
            sync_interval_minutes: if calendar.enabled {
                calendar.sync_interval_minutes
            } else {
                0
            },
            notifier_timeout: Duration::from_secs(self.timeouts.notifier_seconds),
            calendar_timeout: Duration::from_secs(self.timeouts.calendar_seconds),
        })
    }
}

impl CalendarConfig {
    pub fn validate(&self) -> Result<(), InfraError> {
        if !self.enabled {
            return Ok(());
        }
        if self.path.trim().is_empty() {
            return Err(invalid("calendar.path must not be empty".to_string()));
        }
        url::Url::parse(&self.base_url)
            .map_err(|error| invalid(format!("calendar.baseUrl: {error}")))?;
        if self
            .access_token
            .as_deref()
            .is_none_or(|token| token.trim().is_empty())
        {
            return Err(invalid("calendar.accessToken is required when enabled".to_string()));
        }
        if self.sync_window_months == 0 {
            return Err(invalid("calendar.syncWindowMonths must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_dir() -> TempDir {
        let dir = tempfile::tempdir().expect("temp dir");
        ensure_default_configs(dir.path()).expect("write defaults");
        dir
    }

    fn write_json(dir: &Path, name: &str, value: serde_json::Value) {
        fs::write(dir.join(name), value.to_string()).expect("write config");
    }

    #[test]
    fn defaults_load_and_resolve() {
        let dir = config_dir();
        let bundle = load_configs(dir.path()).expect("load defaults");
        assert!(!bundle.calendar.enabled);

        let scheduler = bundle
            .app
            .scheduler_config(&bundle.calendar)
            .expect("resolve");
        assert_eq!(scheduler.timezone, chrono_tz::UTC);
        assert_eq!(scheduler.nudge_day, Weekday::Sun);
        assert_eq!(scheduler.morning_digest, NaiveTime::from_hms_opt(8, 0, 0).expect("time"));
        assert_eq!(scheduler.sync_interval_minutes, 0);
        assert_eq!(scheduler.notifier_timeout, Duration::from_secs(10));
    }

    #[test]
    fn ensure_default_configs_keeps_existing_files() {
        let dir = config_dir();
        write_json(
            dir.path(),
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "timezone": "Europe/Berlin",
                "morningDigest": "07:30",
                "eveningDigest": "21:00",
                "weeklyNudge": { "day": "Friday", "time": "17:00" }
            }),
        );
        ensure_default_configs(dir.path()).expect("second run");

        let bundle = load_configs(dir.path()).expect("load");
        assert_eq!(bundle.app.timezone, "Europe/Berlin");
        assert_eq!(bundle.app.timeouts, TimeoutConfig::default());
    }

    #[test]
    fn rejects_unknown_schema() {
        let dir = config_dir();
        write_json(
            dir.path(),
            CALENDAR_JSON,
            serde_json::json!({ "schema": 2, "path": "primary" }),
        );
        let error = load_configs(dir.path()).expect_err("schema 2 is unsupported");
        assert!(error.to_string().contains("unsupported schema 2"));
    }

    #[test]
    fn rejects_bad_timezone_and_times() {
        let dir = config_dir();
        write_json(
            dir.path(),
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "timezone": "Mars/Olympus",
                "morningDigest": "08:00",
                "eveningDigest": "20:00",
                "weeklyNudge": { "day": "Sunday", "time": "18:00" }
            }),
        );
        assert!(matches!(load_configs(dir.path()), Err(InfraError::InvalidConfig(_))));

        write_json(
            dir.path(),
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "timezone": "UTC",
                "morningDigest": "8am",
                "eveningDigest": "20:00",
                "weeklyNudge": { "day": "Sunday", "time": "18:00" }
            }),
        );
        assert!(matches!(load_configs(dir.path()), Err(InfraError::InvalidConfig(_))));
    }

    #[test]
    fn enabled_calendar_requires_token() {
        let dir = config_dir();
        write_json(
            dir.path(),
            CALENDAR_JSON,
            serde_json::json!({ "schema": 1, "enabled": true, "path": "family" }),
        );
        assert!(matches!(load_configs(dir.path()), Err(InfraError::InvalidConfig(_))));

        write_json(
            dir.path(),
            CALENDAR_JSON,
            serde_json::json!({
                "schema": 1,
                "enabled": true,
                "path": "family",
                "accessToken": "secret",
                "syncIntervalMinutes": 15
            }),
        );
        let bundle = load_configs(dir.path()).expect("valid calendar config");
        assert_eq!(bundle.calendar.sync_window_months, 3);
        assert_eq!(
            bundle
                .app
                .scheduler_config(&bundle.calendar)
                .expect("resolve")
                .sync_interval_minutes,
            15
        );
    }
}
