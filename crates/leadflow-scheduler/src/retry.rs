//! Retry policy: how long to wait before re-delivering a failed step.
//!
//! | step kind            | delay                                         |
//! |----------------------|-----------------------------------------------|
//! | outbound call        | fixed                                         |
//! | webhook              | fixed                                         |
//! | qualification        | fixed, or `fixed × (attempt + 1)` when linear |
//! | calendar, network    | `2^attempt` seconds, capped                   |
//! | calendar, other      | fixed                                         |

use leadflow_core::config::{QualificationBackoff, RetryConfig};
use leadflow_core::{LeadflowError, StepKind};
use std::time::Duration;

/// Per-kind retry decision, built once from config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub fixed_delay: Duration,
    pub qualification_backoff: QualificationBackoff,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            fixed_delay: Duration::from_secs(config.fixed_delay_secs),
            qualification_backoff: config.qualification_backoff,
            backoff_cap: Duration::from_secs(config.backoff_cap_secs),
        }
    }

    /// Whether a retryable failure on `attempt` may be rescheduled.
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before re-delivering after a failure on `attempt` (0-based).
    pub fn delay(&self, kind: StepKind, attempt: u32, error: &LeadflowError) -> Duration {
        match kind {
            StepKind::OutboundCall | StepKind::WebhookNotify => self.fixed_delay,
            StepKind::QualificationCheck => match self.qualification_backoff {
                QualificationBackoff::Fixed => self.fixed_delay,
                QualificationBackoff::Linear => self.fixed_delay * (attempt + 1),
            },
            StepKind::CalendarBooking if error.is_network() => {
                let secs = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
                Duration::from_secs(secs).min(self.backoff_cap)
            }
            StepKind::CalendarBooking => self.fixed_delay,
        }
    }
}
