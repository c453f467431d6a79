//! QualificationCheck: decide whether a lead meets the node's criteria.
//!
//! ## Flow
//! ```text
//!            ┌── verify_fields(leadData, criteria) ───────────────┐
//! execute ───┤                                                    ├─ join → AND → Verdict
//!            └── check_url(website) ─ invalid → rejected          │
//!                              └─ valid → scrape(website, prompt) ┘
//! ```
//! Field evaluation always runs. The site branch only runs when scraping is
//! enabled and the lead has a website. A rejection is a verdict, not an error.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use leadflow_core::config::AgentConfig;
use leadflow_core::traits::{FlowGraphStore, LeadStateStore, StepExecutor};
use leadflow_core::{
    LeadUpdate, LeadflowError, RemoteErrorKind, Result, StepKind, StepMessage, StepOutput,
    Verification,
};

use crate::http::HttpClient;
use crate::settings;

/// Content-safety verdict for a URL.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlCheck {
    pub is_valid: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Remote evaluators behind the qualification step.
#[async_trait]
pub trait QualificationService: Send + Sync {
    async fn check_url(&self, url: &str) -> Result<UrlCheck>;

    async fn verify_fields(
        &self,
        lead_data: &serde_json::Value,
        criteria: &serde_json::Value,
    ) -> Result<bool>;

    async fn scrape(&self, url: &str, prompt: &str) -> Result<bool>;
}

/// Qualification agent service plus an OpenAI-compatible safety checker.
pub struct AgentQualifier {
    http: HttpClient,
    agent: AgentConfig,
}

#[derive(Deserialize)]
struct PassReply {
    pass: bool,
}

const SAFETY_PROMPT: &str = "You are a content safety analysis assistant. \
You will verify the validity of URLs and determine if they contain any sensitive content. \
Return the content in JSON with the format: \
{\"isValid\": true/false, \"reason\": \"tell the specific reason in less than 10 words\"}";

impl AgentQualifier {
    pub fn new(http: HttpClient, agent: AgentConfig) -> Self {
        Self { http, agent }
    }

    fn endpoint(&self, route: &str) -> String {
        format!("{}/{}", self.agent.base_url.trim_end_matches('/'), route)
    }
}

#[async_trait]
impl QualificationService for AgentQualifier {
    async fn check_url(&self, url: &str) -> Result<UrlCheck> {
        let body = serde_json::json!({
            "model": self.agent.openai_model,
            "messages": [
                {"role": "system", "content": SAFETY_PROMPT},
                {
                    "role": "user",
                    "content": format!(
                        "Check the following URL: {url}. Tell me if it is valid and if it contains any sensitive content."
                    )
                }
            ]
        });
        let reply = self
            .http
            .post_json(
                "openai",
                &self.agent.openai_url,
                &body,
                Some(&self.agent.openai_api_key),
                None,
            )
            .await?
            .json("openai")?;

        let content = reply["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                LeadflowError::remote("openai", RemoteErrorKind::Decode, "missing message content")
            })?;
        serde_json::from_str(content.trim()).map_err(|e| {
            LeadflowError::remote(
                "openai",
                RemoteErrorKind::Decode,
                format!("safety verdict is not JSON: {e}"),
            )
        })
    }

    async fn verify_fields(
        &self,
        lead_data: &serde_json::Value,
        criteria: &serde_json::Value,
    ) -> Result<bool> {
        // The agent expects both documents as JSON strings.
        let body = serde_json::json!({
            "leadData": lead_data.to_string(),
            "criteriaField": criteria.to_string(),
        });
        let reply = self
            .http
            .post_json("agent", &self.endpoint("preverify"), &body, None, None)
            .await?;
        Ok(reply.parse::<PassReply>("agent")?.pass)
    }

    async fn scrape(&self, url: &str, prompt: &str) -> Result<bool> {
        let body = serde_json::json!({"url": url, "promptCriteria": prompt});
        let reply = self
            .http
            .post_json("agent", &self.endpoint("scrape"), &body, None, None)
            .await?;
        Ok(reply.parse::<PassReply>("agent")?.pass)
    }
}

enum SiteCheck {
    Skipped,
    Unsafe(Option<String>),
    Scraped(bool),
}

pub struct QualificationStep {
    service: Arc<dyn QualificationService>,
    flows: Arc<dyn FlowGraphStore>,
    leads: Arc<dyn LeadStateStore>,
}

impl QualificationStep {
    pub fn new(
        service: Arc<dyn QualificationService>,
        flows: Arc<dyn FlowGraphStore>,
        leads: Arc<dyn LeadStateStore>,
    ) -> Self {
        Self {
            service,
            flows,
            leads,
        }
    }

    async fn check_site(&self, website: Option<&str>, prompt: Option<&str>) -> Result<SiteCheck> {
        let (Some(url), Some(prompt)) = (website, prompt) else {
            return Ok(SiteCheck::Skipped);
        };
        let check = self.service.check_url(url).await?;
        if !check.is_valid {
            return Ok(SiteCheck::Unsafe(check.reason));
        }
        Ok(SiteCheck::Scraped(self.service.scrape(url, prompt).await?))
    }
}

#[async_trait]
impl StepExecutor for QualificationStep {
    fn kind(&self) -> StepKind {
        StepKind::QualificationCheck
    }

    async fn execute(&self, message: &StepMessage) -> Result<StepOutput> {
        let node = self.flows.get_node(&message.flow_id, &message.target_node).await?;
        let criteria = settings::required_value(&node, "criteria")?;
        let prompt = settings::optional_str(&node, "webScrapingPrompt");
        let scraping = settings::flag(&node, "enableWebScraping").unwrap_or(prompt.is_some());
        if scraping && prompt.is_none() {
            return Err(LeadflowError::validation(format!(
                "Node '{}' enables web scraping without 'webScrapingPrompt'",
                node.id
            )));
        }

        let lead = self.leads.get_lead(&message.lead_id).await?;
        let website = if scraping { lead.website() } else { None };

        let (fields, site) = futures::join!(
            self.service.verify_fields(&lead.lead_data, criteria),
            self.check_site(website, prompt),
        );
        // An unsafe site settles the verdict whatever the field check returned.
        let (passed, reason) = match site? {
            SiteCheck::Unsafe(reason) => {
                if let Err(e) = &fields {
                    tracing::debug!("Field check for lead {} ignored after unsafe URL: {e}", lead.id);
                }
                (
                    false,
                    Some(reason.unwrap_or_else(|| "Website failed the safety check".into())),
                )
            }
            site => match (fields?, site) {
                (_, SiteCheck::Scraped(false)) => {
                    (false, Some("Website does not meet the criteria".into()))
                }
                (false, _) => (false, Some("Lead data does not meet the criteria".into())),
                (true, _) => (true, None),
            },
        };

        self.leads
            .update_lead(
                &lead.id,
                LeadUpdate::verification(Verification {
                    passed,
                    reason: reason.clone(),
                    checked_at: chrono::Utc::now(),
                }),
            )
            .await?;
        tracing::info!(
            "🔎 Qualification for lead {}: {}",
            lead.id,
            if passed { "passed" } else { "rejected" }
        );
        Ok(StepOutput::Verdict { passed, reason })
    }
}
