//! Error taxonomy shared by every Leadflow crate.
//!
//! Step failures are classified, never thrown across the scheduling boundary:
//! the lifecycle controller asks an error whether it is retryable, fatal, or an
//! infrastructure outage and decides what happens next.

use std::error::Error as _;
use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LeadflowError>;

/// Upper bound for the stack-trace text stored on a failed lead.
pub const MAX_TRACE_CHARS: usize = 5000;

#[derive(Debug, thiserror::Error)]
pub enum LeadflowError {
    /// A referenced flow, node, lead, user or connection does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Required node setting missing or malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transport, timeout or non-2xx answer from an external service.
    #[error("{0}")]
    Remote(RemoteError),

    /// The lead store or dispatcher itself is unavailable.
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How an error is handled by the lifecycle controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Eligible for rescheduling while attempts remain.
    Retryable,
    /// Written to the lead immediately, never retried.
    Fatal,
    /// Aborts the lifecycle wrapper; not charged to the retry budget.
    Infrastructure,
}

impl LeadflowError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn infra(msg: impl fmt::Display) -> Self {
        Self::Infrastructure(msg.to_string())
    }

    pub fn remote(service: &str, kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self::Remote(RemoteError {
            service: service.to_string(),
            kind,
            message: message.into(),
        })
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::Remote(_) => FailureClass::Retryable,
            Self::Infrastructure(_) | Self::Io(_) => FailureClass::Infrastructure,
            Self::NotFound(_) | Self::Validation(_) | Self::Config(_) | Self::Json(_) => {
                FailureClass::Fatal
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::Retryable
    }

    pub fn is_infrastructure(&self) -> bool {
        self.class() == FailureClass::Infrastructure
    }

    /// True for timeouts, refused connections and 5xx answers.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Remote(r) if r.kind.is_network())
    }

    /// Render the error, its source chain and debug form, capped at
    /// [`MAX_TRACE_CHARS`] characters.
    pub fn trace(&self) -> String {
        let mut out = self.to_string();
        let mut source = self.source();
        while let Some(cause) = source {
            out.push_str("\nCaused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out.push_str("\n\n");
        out.push_str(&format!("{self:#?}"));
        truncate_chars(&out, MAX_TRACE_CHARS)
    }
}

/// Failure reported by an external request/response collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Which service answered: "telephony", "agent", "openai", "google", "webhook".
    pub service: String,
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RemoteErrorKind::Status(code) => {
                write!(f, "{} returned HTTP {}: {}", self.service, code, self.message)
            }
            _ => write!(f, "{} {:?}: {}", self.service, self.kind, self.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    Timeout,
    Connect,
    Status(u16),
    Decode,
    TokenRefresh,
    Other,
}

impl RemoteErrorKind {
    pub fn is_network(&self) -> bool {
        match self {
            Self::Timeout | Self::Connect => true,
            Self::Status(code) => *code >= 500,
            Self::Decode | Self::TokenRefresh | Self::Other => false,
        }
    }
}

/// Cut a string to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
