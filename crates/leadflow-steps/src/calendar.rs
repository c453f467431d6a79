//! CalendarBooking: book the nearest free slot on the flow owner's calendar.
//!
//! 1. Load the named connection of the owning user.
//! 2. Rotate the access token if it expired; persist the new tokens at once.
//! 3. Fetch busy intervals for the search horizon. A 401 here forces one
//!    refresh and a second try, since stored tokens may carry no expiry.
//! 4. Pick the earliest free slot (`find_nearest_slot`).
//! 5. Insert the event with a Meet conference.
//!
//! No free slot is a successful, empty result. This step never writes the
//! lead status; the lifecycle controller owns that.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;

use leadflow_core::config::{CalendarConfig, GoogleConfig};
use leadflow_core::traits::{FlowGraphStore, LeadStateStore, StepExecutor, UserStore};
use leadflow_core::{
    BusySlot, LeadflowError, Node, OAuthTokens, RemoteErrorKind, Result, StepKind, StepMessage,
    StepOutput,
};
use leadflow_scheduler::{WorkingWindow, find_nearest_slot};

use crate::http::HttpClient;
use crate::settings;

/// Event to insert on the calendar.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRequest {
    pub summary: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub time_zone: String,
    pub attendee: String,
    /// Conference request id; stable per logical step so redelivery reuses it.
    pub request_id: String,
}

/// Links of a created event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventLinks {
    pub calendar_link: Option<String>,
    pub meet_link: Option<String>,
}

/// External calendar provider.
#[async_trait]
pub trait CalendarService: Send + Sync {
    /// Exchange the refresh token for a new access token.
    async fn refresh(&self, tokens: &OAuthTokens, now: DateTime<Utc>) -> Result<OAuthTokens>;

    /// New tokens when `tokens` expired, `None` when still valid.
    async fn refresh_if_expired(
        &self,
        tokens: &OAuthTokens,
        now: DateTime<Utc>,
    ) -> Result<Option<OAuthTokens>> {
        if !tokens.is_expired(now) {
            return Ok(None);
        }
        self.refresh(tokens, now).await.map(Some)
    }

    async fn busy_slots(
        &self,
        tokens: &OAuthTokens,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BusySlot>>;

    async fn create_event(&self, tokens: &OAuthTokens, event: &EventRequest) -> Result<EventLinks>;
}

// ─── Google Calendar ─────────────────────────────────────

pub struct GoogleCalendar {
    http: HttpClient,
    google: GoogleConfig,
    calendar_id: String,
}

#[derive(Deserialize)]
struct TokenReply {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct BusyInterval {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl GoogleCalendar {
    pub fn new(http: HttpClient, google: GoogleConfig, calendar: &CalendarConfig) -> Self {
        Self {
            http,
            google,
            calendar_id: calendar.calendar_id.clone(),
        }
    }

    fn api(&self, route: &str) -> String {
        format!("{}/{}", self.google.calendar_api.trim_end_matches('/'), route)
    }
}

#[async_trait]
impl CalendarService for GoogleCalendar {
    async fn refresh(&self, tokens: &OAuthTokens, now: DateTime<Utc>) -> Result<OAuthTokens> {
        let refresh_token = tokens.refresh_token.as_deref().ok_or_else(|| {
            LeadflowError::remote("google", RemoteErrorKind::TokenRefresh, "no refresh token stored")
        })?;

        let request = self.http.post(&self.google.token_uri).form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.google.client_id.as_str()),
            ("client_secret", self.google.client_secret.as_str()),
        ]);
        let reply: TokenReply = self.http.send("google", request).await?.parse("google")?;

        tracing::debug!("🔑 Google access token refreshed");
        Ok(OAuthTokens {
            access_token: reply.access_token,
            // Google omits the refresh token when it is unchanged.
            refresh_token: reply.refresh_token.or_else(|| tokens.refresh_token.clone()),
            expiry: reply.expires_in.map(|secs| now + Duration::seconds(secs)),
        })
    }

    async fn busy_slots(
        &self,
        tokens: &OAuthTokens,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BusySlot>> {
        let body = serde_json::json!({
            "timeMin": from.to_rfc3339(),
            "timeMax": to.to_rfc3339(),
            "timeZone": "UTC",
            "items": [{"id": self.calendar_id}],
        });
        let reply = self
            .http
            .post_json("google", &self.api("freeBusy"), &body, Some(&tokens.access_token), None)
            .await?
            .json("google")?;

        let busy = &reply["calendars"][self.calendar_id.as_str()]["busy"];
        if busy.is_null() {
            return Ok(Vec::new());
        }
        let intervals: Vec<BusyInterval> = serde_json::from_value(busy.clone()).map_err(|e| {
            LeadflowError::remote("google", RemoteErrorKind::Decode, format!("busy list: {e}"))
        })?;
        Ok(intervals
            .into_iter()
            .map(|b| BusySlot::new(b.start, b.end))
            .collect())
    }

    async fn create_event(&self, tokens: &OAuthTokens, event: &EventRequest) -> Result<EventLinks> {
        let body = serde_json::json!({
            "summary": event.summary,
            "description": event.description,
            "start": {"dateTime": event.start.to_rfc3339(), "timeZone": event.time_zone},
            "end": {"dateTime": event.end.to_rfc3339(), "timeZone": event.time_zone},
            "attendees": [{"email": event.attendee}],
            "reminders": {"useDefault": true},
            "conferenceData": {
                "createRequest": {
                    "requestId": event.request_id,
                    "conferenceSolutionKey": {"type": "hangoutsMeet"}
                }
            }
        });
        let url = format!(
            "{}?conferenceDataVersion=1",
            self.api(&format!("calendars/{}/events", self.calendar_id))
        );
        let reply = self
            .http
            .post_json("google", &url, &body, Some(&tokens.access_token), Some(&event.request_id))
            .await?
            .json("google")?;

        let meet_link = reply["conferenceData"]["entryPoints"]
            .as_array()
            .and_then(|points| {
                points
                    .iter()
                    .find(|p| p["entryPointType"] == "video")
                    .and_then(|p| p["uri"].as_str())
            })
            .map(String::from);
        Ok(EventLinks {
            calendar_link: reply["htmlLink"].as_str().map(String::from),
            meet_link,
        })
    }
}

// ─── Step ────────────────────────────────────────────────

pub struct CalendarStep {
    calendar: Arc<dyn CalendarService>,
    flows: Arc<dyn FlowGraphStore>,
    leads: Arc<dyn LeadStateStore>,
    users: Arc<dyn UserStore>,
    horizon_days: u32,
}

impl CalendarStep {
    pub fn new(
        calendar: Arc<dyn CalendarService>,
        flows: Arc<dyn FlowGraphStore>,
        leads: Arc<dyn LeadStateStore>,
        users: Arc<dyn UserStore>,
        horizon_days: u32,
    ) -> Self {
        Self {
            calendar,
            flows,
            leads,
            users,
            horizon_days,
        }
    }

    /// Working window described by the node settings.
    pub fn window(&self, node: &Node) -> Result<WorkingWindow> {
        let defaults = WorkingWindow::office_hours();
        let minutes = settings::uint(node, "duration")?.unwrap_or(60);
        let window = WorkingWindow {
            start_weekday: settings::uint(node, "startWorkday")?.unwrap_or(defaults.start_weekday),
            end_weekday: settings::uint(node, "endWorkday")?.unwrap_or(defaults.end_weekday),
            start_time: settings::time_of_day(node, "startTime")?.unwrap_or(defaults.start_time),
            end_time: settings::time_of_day(node, "endTime")?.unwrap_or(defaults.end_time),
            duration: Duration::minutes(i64::from(minutes)),
            horizon_days: self.horizon_days,
        };
        if minutes == 0 || window.start_weekday > 6 || window.end_weekday > 6 {
            return Err(LeadflowError::validation(format!(
                "Node '{}' has an invalid booking window",
                node.id
            )));
        }
        Ok(window)
    }

    async fn store_tokens(
        &self,
        user_id: &str,
        connection_id: &str,
        tokens: OAuthTokens,
    ) -> Result<OAuthTokens> {
        self.users.update_tokens(user_id, connection_id, &tokens).await?;
        tracing::info!("🔑 Rotated tokens saved for connection {}", connection_id);
        Ok(tokens)
    }
}

fn is_unauthorized(error: &LeadflowError) -> bool {
    matches!(error, LeadflowError::Remote(r) if r.kind == RemoteErrorKind::Status(401))
}

#[async_trait]
impl StepExecutor for CalendarStep {
    fn kind(&self) -> StepKind {
        StepKind::CalendarBooking
    }

    async fn execute(&self, message: &StepMessage) -> Result<StepOutput> {
        let node = self.flows.get_node(&message.flow_id, &message.target_node).await?;
        let connection_id = settings::required_str(&node, "connection")?;
        let window = self.window(&node)?;

        let lead = self.leads.get_lead(&message.lead_id).await?;
        let attendee = lead
            .email()
            .ok_or_else(|| LeadflowError::validation(format!("Lead {} has no email", lead.id)))?;
        let user_id = message
            .user_id
            .as_deref()
            .or(lead.owner.as_deref())
            .ok_or_else(|| {
                LeadflowError::validation(format!("No calendar owner for lead {}", lead.id))
            })?;
        let connection = self.users.get_calendar_connection(user_id, connection_id).await?;

        let now = Utc::now();
        let mut tokens = match self.calendar.refresh_if_expired(&connection.tokens, now).await? {
            Some(rotated) => self.store_tokens(user_id, connection_id, rotated).await?,
            None => connection.tokens,
        };

        let horizon_end = now + Duration::days(i64::from(self.horizon_days));
        let busy = match self.calendar.busy_slots(&tokens, now, horizon_end).await {
            Err(e) if is_unauthorized(&e) => {
                tracing::warn!("🔑 Calendar rejected the access token, refreshing: {e}");
                let rotated = self.calendar.refresh(&tokens, now).await?;
                tokens = self.store_tokens(user_id, connection_id, rotated).await?;
                self.calendar.busy_slots(&tokens, now, horizon_end).await?
            }
            other => other?,
        };
        let Some(start) = find_nearest_slot(&busy, &window, now) else {
            tracing::info!("📭 No free slot for lead {} in {} days", lead.id, self.horizon_days);
            return Ok(StepOutput::NoSlot);
        };

        let event = EventRequest {
            summary: settings::optional_str(&node, "eventName")
                .unwrap_or("No Title")
                .to_string(),
            description: settings::optional_str(&node, "description")
                .unwrap_or("Meeting created automatically")
                .to_string(),
            start,
            end: start + window.duration,
            time_zone: message.time_zone.clone().unwrap_or_else(|| "UTC".into()),
            attendee: attendee.to_string(),
            request_id: format!("meet-{}", message.id),
        };
        let links = self.calendar.create_event(&tokens, &event).await?;

        tracing::info!("📅 Meeting booked for lead {} at {}", lead.id, start.to_rfc3339());
        Ok(StepOutput::Completed(serde_json::json!({
            "calendarLink": links.calendar_link,
            "meetLink": links.meet_link,
            "start": start.to_rfc3339(),
        })))
    }
}
