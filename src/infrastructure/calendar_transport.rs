use crate::domain::models::RemoteEvent;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::{GoogleCalendarEvent, from_wire, to_wire};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use url::Url;

/// Remote calendar addressed by a path (calendar id). Update is a full
/// overwrite of the event stored under `event.uid`.
#[async_trait]
pub trait RemoteCalendarTransport: Send + Sync {
    async fn list_events(
        &self,
        path: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RemoteEvent>, InfraError>;

    /// Fails with [`InfraError::Conflict`] when the UID already exists.
    async fn create_event(&self, path: &str, event: &RemoteEvent) -> Result<(), InfraError>;

    async fn update_event(&self, path: &str, event: &RemoteEvent) -> Result<(), InfraError>;

    async fn delete_event(&self, path: &str, uid: &str) -> Result<(), InfraError>;
}

/// Google Calendar v3 style JSON API behind a bearer token.
#[derive(Debug, Clone)]
pub struct HttpCalendarTransport {
    client: Client,
    base_url: Url,
    access_token: String,
    time_zone: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct EventsPageResponse {
    items: Option<Vec<GoogleCalendarEvent>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

impl HttpCalendarTransport {
    pub fn new(base_url: &str, access_token: &str) -> Result<Self, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        let mut base_url = Url::parse(base_url)
            .map_err(|error| {
                InfraError::InvalidConfig(format!("invalid calendar base url: {error}"))
            })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client: Client::new(),
            base_url,
            access_token: access_token.trim().to_string(),
            time_zone: None,
        })
    }

    /// IANA zone sent with timed events.
    pub fn with_time_zone(mut self, time_zone: &str) -> Self {
        self.time_zone = Some(time_zone.to_string());
        self
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), InfraError> {
        if value.trim().is_empty() {
            return Err(InfraError::Transport(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn http_error(status: StatusCode, body: &str) -> InfraError {
        let message = if body.trim().is_empty() {
            format!("calendar api error: http {}", status.as_u16())
        } else {
            format!("calendar api error: http {}; body={body}", status.as_u16())
        };
        InfraError::Transport(message)
    }

    fn events_endpoint(&self, path: &str) -> Result<Url, InfraError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| {
                    InfraError::Transport("calendar base URL cannot be a base".to_string())
                })?;
            segments.pop_if_empty();
            segments.push("calendars");
            segments.push(path);
            segments.push("events");
        }
        Ok(url)
    }

    fn event_endpoint(&self, path: &str, uid: &str) -> Result<Url, InfraError> {
        let mut url = self.events_endpoint(path)?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| {
                    InfraError::Transport("calendar events URL cannot be a base".to_string())
                })?;
            segments.push(uid);
        }
        Ok(url)
    }

    async fn read_body(
        response: reqwest::Response,
        operation: &str,
    ) -> Result<(StatusCode, String), InfraError> {
        let status = response.status();
        let body = response.text().await.map_err(|error| {
            InfraError::Transport(format!("failed reading {operation} response: {error}"))
        })?;
        Ok((status, body))
    }
}

#[async_trait]
impl RemoteCalendarTransport for HttpCalendarTransport {
    async fn list_events(
        &self,
        path: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RemoteEvent>, InfraError> {
        Self::ensure_non_empty(path, "calendar path")?;

        let endpoint = self.events_endpoint(path)?;
        let time_min = from.to_rfc3339_opts(SecondsFormat::Secs, true);
        let time_max = to.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut page_token: Option<String> = None;
        let mut events = Vec::new();

        loop {
            let mut request = self
                .client
                .get(endpoint.clone())
                .bearer_auth(&self.access_token)
                .query(&[
                    ("singleEvents", "false"),
                    ("maxResults", "2500"),
                    ("timeMin", time_min.as_str()),
                    ("timeMax", time_max.as_str()),
                ]);
            if let Some(page_token) = page_token.as_deref() {
                request = request.query(&[("pageToken", page_token)]);
            }

            let response = request.send().await.map_err(|error| {
                InfraError::Transport(format!(
                    "network error while listing calendar events: {error}"
                ))
            })?;
            let (status, body) = Self::read_body(response, "events list").await?;
            if !status.is_success() {
                return Err(Self::http_error(status, &body));
            }

            let parsed: EventsPageResponse = serde_json::from_str(&body).map_err(|error| {
                InfraError::Transport(format!("invalid events list payload: {error}"))
            })?;
            events.extend(parsed.items.unwrap_or_default().into_iter().filter_map(from_wire));

            match parsed.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(events)
    }

    async fn create_event(&self, path: &str, event: &RemoteEvent) -> Result<(), InfraError> {
        Self::ensure_non_empty(path, "calendar path")?;
        Self::ensure_non_empty(&event.uid, "event uid")?;

        let endpoint = self.events_endpoint(path)?;
        let response = self
            .client
            .post(endpoint)
            .bearer_auth(&self.access_token)
            .json(&to_wire(event, self.time_zone.as_deref()))
            .send()
            .await
            .map_err(|error| {
                InfraError::Transport(format!("network error while creating event: {error}"))
            })?;

        let (status, body) = Self::read_body(response, "event create").await?;
        if status == StatusCode::CONFLICT {
            return Err(InfraError::Conflict(event.uid.clone()));
        }
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Ok(())
    }

    async fn update_event(&self, path: &str, event: &RemoteEvent) -> Result<(), InfraError> {
        Self::ensure_non_empty(path, "calendar path")?;
        Self::ensure_non_empty(&event.uid, "event uid")?;

        let endpoint = self.event_endpoint(path, &event.uid)?;
        let response = self
            .client
            .put(endpoint)
            .bearer_auth(&self.access_token)
            .json(&to_wire(event, self.time_zone.as_deref()))
            .send()
            .await
            .map_err(|error| {
                InfraError::Transport(format!("network error while updating event: {error}"))
            })?;

        let (status, body) = Self::read_body(response, "event update").await?;
        if status == StatusCode::NOT_FOUND {
            return Err(InfraError::NotFound(format!("remote event {}", event.uid)));
        }
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Ok(())
    }

    async fn delete_event(&self, path: &str, uid: &str) -> Result<(), InfraError> {
        Self::ensure_non_empty(path, "calendar path")?;
        Self::ensure_non_empty(uid, "event uid")?;

        let endpoint = self.event_endpoint(path, uid)?;
        let response = self
            .client
            .delete(endpoint)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|error| {
                InfraError::Transport(format!("network error while deleting event: {error}"))
            })?;

        let (status, body) = Self::read_body(response, "event delete").await?;
        // Already gone counts as deleted.
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(());
        }
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Ok(())
    }
}
