//! Leadflow configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LeadflowError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadflowConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub telephony: TelephonyConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub google: GoogleConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
}

impl LeadflowConfig {
    /// Load config from the default path (~/.leadflow/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        Ok(config.with_env())
    }

    /// Load config from a specific path. Environment overrides are not applied.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LeadflowError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| LeadflowError::Config(format!("Failed to parse config: {e}")))
    }

    /// Save config to the given path.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| LeadflowError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Leadflow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".leadflow")
    }

    /// Apply environment overrides from the process environment.
    pub fn with_env(self) -> Self {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides from an arbitrary lookup.
    pub fn with_env_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("LEADFLOW_DB") {
            self.database.path = v;
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.agent.openai_api_key = v;
        }
        if let Some(v) = get("OPENAI_MODEL") {
            self.agent.openai_model = v;
        }
        if let Some(v) = get("LEADFLOW_AGENT_URL") {
            self.agent.base_url = v;
        }
        if let Some(v) = get("GOOGLE_CLIENT_ID") {
            self.google.client_id = v;
        }
        if let Some(v) = get("GOOGLE_CLIENT_SECRET") {
            self.google.client_secret = v;
        }
        if let Some(v) = get("LEADFLOW_TELEPHONY_URL") {
            self.telephony.url = v;
        }
        if let Some(v) = get("LEADFLOW_TELEPHONY_TOKEN") {
            self.telephony.api_token = v;
        }
        self
    }

    /// Names of required settings that are still empty.
    pub fn validate(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.database.path.trim().is_empty() {
            missing.push("database.path");
        }
        if self.telephony.url.trim().is_empty() {
            missing.push("telephony.url");
        }
        if self.agent.openai_api_key.trim().is_empty() {
            missing.push("agent.openai_api_key");
        }
        if self.google.client_id.trim().is_empty() {
            missing.push("google.client_id");
        }
        if self.google.client_secret.trim().is_empty() {
            missing.push("google.client_secret");
        }
        if self.worker.pool_size == 0 {
            missing.push("worker.pool_size");
        }
        missing
    }

    /// Database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).to_string())
    }
}

/// SQLite store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.leadflow/leadflow.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Workers per step kind.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a claimed delivery stays hidden before redelivery.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

fn default_pool_size() -> usize { 2 }
fn default_poll_interval_ms() -> u64 { 500 }
fn default_lease_secs() -> u64 { 120 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
        }
    }
}

/// Qualification retry delay shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualificationBackoff {
    /// Fixed delay per retry.
    #[default]
    Fixed,
    /// `fixed_delay × (attempt + 1)`.
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_fixed_delay_secs")]
    pub fixed_delay_secs: u64,
    #[serde(default)]
    pub qualification_backoff: QualificationBackoff,
    /// Ceiling for the calendar network-failure exponential delay.
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

fn default_max_retries() -> u32 { 3 }
fn default_fixed_delay_secs() -> u64 { 5 }
fn default_backoff_cap_secs() -> u64 { 60 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            fixed_delay_secs: default_fixed_delay_secs(),
            qualification_backoff: QualificationBackoff::default(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

/// Outbound HTTP settings shared by every remote call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_secs() -> u64 { 30 }
fn default_user_agent() -> String { "Leadflow/0.1".into() }

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

/// Telephony (outbound AI call) provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelephonyConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_token: String,
}

/// Qualification agent service and URL safety checker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_url")]
    pub base_url: String,
    #[serde(default = "default_openai_url")]
    pub openai_url: String,
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
}

fn default_agent_url() -> String { "http://127.0.0.1:5000".into() }
fn default_openai_url() -> String { "https://api.openai.com/v1/chat/completions".into() }
fn default_openai_model() -> String { "gpt-4".into() }

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: default_agent_url(),
            openai_url: default_openai_url(),
            openai_api_key: String::new(),
            openai_model: default_openai_model(),
        }
    }
}

/// Google OAuth client and Calendar API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default = "default_calendar_api")]
    pub calendar_api: String,
}

fn default_token_uri() -> String { "https://oauth2.googleapis.com/token".into() }
fn default_calendar_api() -> String { "https://www.googleapis.com/calendar/v3".into() }

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            token_uri: default_token_uri(),
            calendar_api: default_calendar_api(),
        }
    }
}

/// Slot search settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u32,
    #[serde(default = "default_calendar_id")]
    pub calendar_id: String,
}

fn default_horizon_days() -> u32 { 14 }
fn default_calendar_id() -> String { "primary".into() }

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            horizon_days: default_horizon_days(),
            calendar_id: default_calendar_id(),
        }
    }
}
