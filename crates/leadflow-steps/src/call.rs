//! OutboundCall: ask the telephony service to place one AI call.
//!
//! The call itself runs long after this step returns; its outcome comes back
//! through a separate callback, so success here only means "accepted".

use async_trait::async_trait;
use std::sync::Arc;

use leadflow_core::config::TelephonyConfig;
use leadflow_core::traits::{FlowGraphStore, LeadStateStore, StepExecutor};
use leadflow_core::{LeadflowError, Result, StepKind, StepMessage, StepOutput};

use crate::http::HttpClient;
use crate::settings;

pub struct OutboundCall {
    http: HttpClient,
    telephony: TelephonyConfig,
    flows: Arc<dyn FlowGraphStore>,
    leads: Arc<dyn LeadStateStore>,
}

impl OutboundCall {
    pub fn new(
        http: HttpClient,
        telephony: TelephonyConfig,
        flows: Arc<dyn FlowGraphStore>,
        leads: Arc<dyn LeadStateStore>,
    ) -> Self {
        Self {
            http,
            telephony,
            flows,
            leads,
        }
    }
}

#[async_trait]
impl StepExecutor for OutboundCall {
    fn kind(&self) -> StepKind {
        StepKind::OutboundCall
    }

    async fn execute(&self, message: &StepMessage) -> Result<StepOutput> {
        let node = self.flows.get_node(&message.flow_id, &message.target_node).await?;
        let questions = settings::required_value(&node, "questions")?;
        let lead = self.leads.get_lead(&message.lead_id).await?;
        let phone = message
            .phone_number
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .or_else(|| lead.phone())
            .ok_or_else(|| LeadflowError::validation(format!("Lead {} has no phone number", lead.id)))?;
        if self.telephony.url.is_empty() {
            return Err(LeadflowError::Config("telephony.url is not set".into()));
        }

        let body = serde_json::json!({
            "leadId": lead.id,
            "phone": phone,
            "questions": questions,
            "introduction": settings::optional_str(&node, "introduction"),
            "goodByeMessage": settings::optional_str(&node, "goodByeMessage"),
        });
        let reply = self
            .http
            .post_json(
                "telephony",
                &self.telephony.url,
                &body,
                Some(&self.telephony.api_token),
                Some(&message.id),
            )
            .await?;

        tracing::info!("📞 Call requested for lead {} ({})", lead.id, phone);
        Ok(StepOutput::Completed(reply.json("telephony")?))
    }
}
