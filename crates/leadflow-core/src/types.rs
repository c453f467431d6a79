//! Data model: leads, flows, step messages, calendar slots and tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LeadflowError, Result};

// ─── Lead ────────────────────────────────────────────────

/// Lead lifecycle status. Persisted as the integer tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum LeadStatus {
    Failed,
    New,
    Running,
    Advancing,
    Finished,
}

impl LeadStatus {
    pub fn code(self) -> u8 {
        match self {
            LeadStatus::Failed => 0,
            LeadStatus::New => 1,
            LeadStatus::Running => 2,
            LeadStatus::Advancing => 3,
            LeadStatus::Finished => 9,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(LeadStatus::Failed),
            1 => Some(LeadStatus::New),
            2 => Some(LeadStatus::Running),
            3 => Some(LeadStatus::Advancing),
            9 => Some(LeadStatus::Finished),
            _ => None,
        }
    }
}

impl From<LeadStatus> for u8 {
    fn from(status: LeadStatus) -> u8 {
        status.code()
    }
}

impl TryFrom<u8> for LeadStatus {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, String> {
        LeadStatus::from_code(code).ok_or_else(|| format!("unknown lead status {code}"))
    }
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeadStatus::Failed => write!(f, "failed"),
            LeadStatus::New => write!(f, "new"),
            LeadStatus::Running => write!(f, "running"),
            LeadStatus::Advancing => write!(f, "advancing"),
            LeadStatus::Finished => write!(f, "finished"),
        }
    }
}

/// Failure annotation attached to a lead that ended in [`LeadStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub status: bool,
    pub message: String,
    pub task_id: String,
    pub stack_trace: String,
}

/// Result of a qualification check, written onto the lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// A prospect record moving through a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
    /// Free-form profile fields, including `customFields`.
    #[serde(default)]
    pub lead_data: serde_json::Value,
    #[serde(default = "default_status")]
    pub status: LeadStatus,
    #[serde(default)]
    pub current_node: Option<String>,
    #[serde(default)]
    pub error: Option<ErrorRecord>,
    #[serde(default)]
    pub verification: Option<Verification>,
}

fn default_status() -> LeadStatus {
    LeadStatus::New
}

impl Lead {
    pub fn new(id: &str, name: &str, lead_data: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            owner: None,
            lead_data,
            status: LeadStatus::New,
            current_node: None,
            error: None,
            verification: None,
        }
    }

    /// Top-level string field of `leadData`, ignoring empty values.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.lead_data
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    /// Custom field lookup. Accepts both `customFields` and `custom_fields`.
    pub fn custom_field(&self, key: &str) -> Option<&str> {
        ["customFields", "custom_fields"]
            .iter()
            .filter_map(|bag| self.lead_data.get(*bag))
            .find_map(|bag| bag.get(key).and_then(|v| v.as_str()))
            .filter(|s| !s.trim().is_empty())
    }

    pub fn email(&self) -> Option<&str> {
        self.field("email")
    }

    pub fn phone(&self) -> Option<&str> {
        self.field("phone")
            .or_else(|| self.field("phone_number"))
            .or_else(|| self.field("phoneNumber"))
    }

    pub fn website(&self) -> Option<&str> {
        self.custom_field("website_link")
    }
}

/// Single atomic change applied to a lead document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeadUpdate {
    pub status: Option<LeadStatus>,
    pub current_node: Option<String>,
    pub error: Option<ErrorRecord>,
    pub verification: Option<Verification>,
}

impl LeadUpdate {
    /// Terminal failure: status and error record in one write.
    pub fn failed(record: ErrorRecord) -> Self {
        Self {
            status: Some(LeadStatus::Failed),
            error: Some(record),
            ..Self::default()
        }
    }

    /// Status only; the current node stays where it is.
    pub fn status(status: LeadStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn verification(verification: Verification) -> Self {
        Self {
            verification: Some(verification),
            ..Self::default()
        }
    }
}

// ─── Flow graph ──────────────────────────────────────────

/// One step definition inside a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl Node {
    /// Step kind encoded in the node id prefix (`sendWebhook_3` → WebhookNotify).
    pub fn kind(&self) -> Result<StepKind> {
        StepKind::from_node_id(&self.id)
    }
}

/// Directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub source: String,
    pub target: String,
}

impl Route {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
        }
    }
}

/// A directed graph of configurable steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl Flow {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }
}

// ─── Step messages ───────────────────────────────────────

/// The four side-effecting step variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepKind {
    OutboundCall,
    QualificationCheck,
    CalendarBooking,
    WebhookNotify,
}

impl StepKind {
    pub const ALL: [StepKind; 4] = [
        StepKind::OutboundCall,
        StepKind::QualificationCheck,
        StepKind::CalendarBooking,
        StepKind::WebhookNotify,
    ];

    /// Node type name used in node ids and queue names.
    pub fn node_type(self) -> &'static str {
        match self {
            StepKind::OutboundCall => "aiCall",
            StepKind::QualificationCheck => "preVerify",
            StepKind::CalendarBooking => "googleCalendar",
            StepKind::WebhookNotify => "sendWebhook",
        }
    }

    pub fn queue_name(self) -> String {
        format!("{}.consumer", self.node_type())
    }

    pub fn from_node_type(node_type: &str) -> Option<Self> {
        StepKind::ALL.into_iter().find(|k| k.node_type() == node_type)
    }

    /// Parse the kind from a node id such as `preVerify_2`.
    pub fn from_node_id(node_id: &str) -> Result<Self> {
        let prefix = node_id.split('_').next().unwrap_or_default();
        Self::from_node_type(prefix).ok_or_else(|| {
            LeadflowError::validation(format!("Unknown node type '{prefix}' in node '{node_id}'"))
        })
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.node_type())
    }
}

/// Scheduled unit of work: one node applied to one lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMessage {
    /// Stable across retries of the same logical step; used as idempotency key.
    pub id: String,
    pub kind: StepKind,
    pub lead_id: String,
    pub flow_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub target_node: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub time_zone: Option<String>,
    /// Retries already consumed. Zero for a freshly scheduled step.
    #[serde(default)]
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl StepMessage {
    /// New step for `target_node`; the kind comes from the node id prefix.
    pub fn new(
        lead_id: &str,
        flow_id: &str,
        user_id: Option<&str>,
        target_node: &str,
    ) -> Result<Self> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: StepKind::from_node_id(target_node)?,
            lead_id: lead_id.to_string(),
            flow_id: flow_id.to_string(),
            user_id: user_id.map(String::from),
            target_node: target_node.to_string(),
            phone_number: None,
            time_zone: None,
            attempt: 0,
            created_at: Utc::now(),
        })
    }

    /// Same message, one more retry consumed.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    pub fn is_retry(&self) -> bool {
        self.attempt > 0
    }

    pub fn routing_key(&self) -> String {
        format!(
            "{}.{}.{}",
            self.user_id.as_deref().unwrap_or("-"),
            self.flow_id,
            self.target_node
        )
    }

    pub fn envelope(&self) -> Envelope {
        Envelope {
            routing_key: self.routing_key(),
            data: self.clone(),
            date_time: Utc::now(),
        }
    }
}

/// Wire form of a step message on the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub routing_key: String,
    pub data: StepMessage,
    pub date_time: DateTime<Utc>,
}

impl Envelope {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// What an executor hands back on success.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    /// Provider acknowledgement or response payload.
    Completed(serde_json::Value),
    /// Qualification verdict. A rejection is a result, not an error.
    Verdict { passed: bool, reason: Option<String> },
    /// Calendar search found no free slot inside the horizon.
    NoSlot,
}

// ─── Calendar ────────────────────────────────────────────

/// Half-open busy interval `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusySlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BusySlot {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Standard half-open overlap test.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < self.end && end > self.start
    }
}

/// Stored OAuth credentials of a calendar connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Also read from `expiry_date` (epoch millis) as Google client libraries store it.
    #[serde(default, alias = "expiry_date", deserialize_with = "expiry_from_any")]
    pub expiry: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredExpiry {
    Millis(i64),
    Timestamp(DateTime<Utc>),
}

fn expiry_from_any<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<StoredExpiry>::deserialize(deserializer)? {
        Some(StoredExpiry::Millis(ms)) => DateTime::from_timestamp_millis(ms),
        Some(StoredExpiry::Timestamp(at)) => Some(at),
        None => None,
    })
}

impl OAuthTokens {
    /// Expired, or expiring within the next minute.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) => expiry <= now + chrono::Duration::seconds(60),
            None => false,
        }
    }
}

/// A user's connected calendar account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarConnection {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    pub tokens: OAuthTokens,
}
