//! WebhookNotify: POST a timestamped lead snapshot to the node's URL.

use async_trait::async_trait;
use std::sync::Arc;

use leadflow_core::traits::{FlowGraphStore, LeadStateStore, StepExecutor};
use leadflow_core::{Result, StepKind, StepMessage, StepOutput};

use crate::http::HttpClient;
use crate::settings;

pub struct WebhookNotify {
    http: HttpClient,
    flows: Arc<dyn FlowGraphStore>,
    leads: Arc<dyn LeadStateStore>,
}

impl WebhookNotify {
    pub fn new(
        http: HttpClient,
        flows: Arc<dyn FlowGraphStore>,
        leads: Arc<dyn LeadStateStore>,
    ) -> Self {
        Self { http, flows, leads }
    }
}

#[async_trait]
impl StepExecutor for WebhookNotify {
    fn kind(&self) -> StepKind {
        StepKind::WebhookNotify
    }

    async fn execute(&self, message: &StepMessage) -> Result<StepOutput> {
        let node = self.flows.get_node(&message.flow_id, &message.target_node).await?;
        let url = settings::required_str(&node, "webhookUrl")?;
        let lead = self.leads.get_lead(&message.lead_id).await?;

        let payload = serde_json::json!({
            "lead_data": lead.lead_data,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let reply = self
            .http
            .post_json("webhook", url, &payload, None, Some(&message.id))
            .await?;

        tracing::info!("✅ Webhook sent to {} for lead {} ({})", url, lead.id, reply.status);
        Ok(StepOutput::Completed(serde_json::json!({
            "status": reply.status,
            "data": reply.body,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_core::config::HttpConfig;
    use leadflow_core::{Flow, Lead, LeadflowError, Node, RemoteErrorKind};
    use leadflow_scheduler::SqliteStore;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn setup(url: &str) -> (WebhookNotify, StepMessage) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .save_flow(&Flow {
                id: "f1".into(),
                name: "demo".into(),
                owner: None,
                nodes: vec![
                    Node {
                        id: "sendWebhook_1".into(),
                        settings: serde_json::json!({"webhookUrl": url}),
                    },
                    Node { id: "sendWebhook_2".into(), settings: serde_json::json!({}) },
                ],
                routes: vec![],
            })
            .unwrap();
        store
            .save_lead(&Lead::new("l1", "Acme", serde_json::json!({"email": "a@acme.test"})))
            .unwrap();
        let http = HttpClient::new(&HttpConfig::default()).unwrap();
        let step = WebhookNotify::new(http, store.clone(), store);
        let msg = StepMessage::new("l1", "f1", None, "sendWebhook_1").unwrap();
        (step, msg)
    }

    #[tokio::test]
    async fn test_posts_lead_snapshot() {
        let server = MockServer::start().await;
        let (step, msg) = setup(&format!("{}/hook", server.uri()));
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("Idempotency-Key", msg.id.as_str()))
            .and(body_partial_json(serde_json::json!({"lead_data": {"email": "a@acme.test"}})))
            .respond_with(ResponseTemplate::new(200).set_body_string("received"))
            .expect(1)
            .mount(&server)
            .await;

        let output = step.execute(&msg).await.unwrap();
        assert_eq!(
            output,
            StepOutput::Completed(serde_json::json!({"status": 200, "data": "received"}))
        );
    }

    #[tokio::test]
    async fn test_non_2xx_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let (step, msg) = setup(&server.uri());

        let err = step.execute(&msg).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            LeadflowError::Remote(ref r) if r.kind == RemoteErrorKind::Status(502)
        ));
    }

    #[tokio::test]
    async fn test_missing_url_is_fatal() {
        let (step, mut msg) = setup("http://unused");
        msg.target_node = "sendWebhook_2".into();
        let err = step.execute(&msg).await.unwrap_err();
        assert!(matches!(err, LeadflowError::Validation(_)));
    }
}
