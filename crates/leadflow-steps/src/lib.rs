//! # Leadflow Steps
//!
//! The four side-effecting step executors and the remote clients they use.
//!
//! | node type        | executor             | remote                          |
//! |------------------|----------------------|---------------------------------|
//! | `aiCall`         | [`OutboundCall`]     | telephony service               |
//! | `preVerify`      | [`QualificationStep`]| OpenAI safety check, agent API  |
//! | `googleCalendar` | [`CalendarStep`]     | Google OAuth + Calendar API     |
//! | `sendWebhook`    | [`WebhookNotify`]    | node's webhook URL              |

pub mod calendar;
pub mod call;
pub mod http;
pub mod qualify;
pub mod settings;
pub mod webhook;

pub use calendar::{CalendarService, CalendarStep, GoogleCalendar};
pub use call::OutboundCall;
pub use http::HttpClient;
pub use qualify::{AgentQualifier, QualificationService, QualificationStep};
pub use webhook::WebhookNotify;

use std::sync::Arc;

use leadflow_core::traits::{FlowGraphStore, LeadStateStore, StepRegistry, UserStore};
use leadflow_core::{LeadflowConfig, Result};

/// Wire every executor against the given stores.
pub fn build_registry(
    config: &LeadflowConfig,
    flows: Arc<dyn FlowGraphStore>,
    leads: Arc<dyn LeadStateStore>,
    users: Arc<dyn UserStore>,
) -> Result<StepRegistry> {
    let http = HttpClient::new(&config.http)?;

    let qualifier = Arc::new(AgentQualifier::new(http.clone(), config.agent.clone()));
    let google = Arc::new(GoogleCalendar::new(
        http.clone(),
        config.google.clone(),
        &config.calendar,
    ));

    Ok(StepRegistry {
        outbound_call: Arc::new(OutboundCall::new(
            http.clone(),
            config.telephony.clone(),
            flows.clone(),
            leads.clone(),
        )),
        qualification: Arc::new(QualificationStep::new(qualifier, flows.clone(), leads.clone())),
        calendar: Arc::new(CalendarStep::new(
            google,
            flows.clone(),
            leads.clone(),
            users,
            config.calendar.horizon_days,
        )),
        webhook: Arc::new(WebhookNotify::new(http, flows, leads)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_core::StepKind;
    use leadflow_scheduler::SqliteStore;

    #[test]
    fn test_registry_matches_kinds() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let registry = build_registry(
            &LeadflowConfig::default(),
            store.clone(),
            store.clone(),
            store,
        )
        .unwrap();
        for kind in StepKind::ALL {
            assert_eq!(registry.get(kind).kind(), kind);
        }
    }
}
