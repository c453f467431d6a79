//! Flow traversal: does a lead's journey continue after a node, and
//! launching the successor step.
//!
//! ## Architecture
//! ```text
//! step succeeded on node N
//!   → any route with source == N ?
//!       yes → Advancing (successor launched by FlowLauncher::publish)
//!       no  → Finished
//! ```

use std::sync::Arc;
use std::time::Duration;

use leadflow_core::traits::{Dispatcher, FlowGraphStore, LeadStateStore};
use leadflow_core::{LeadStatus, LeadflowError, Result, Route, StepMessage};

/// True when some route leaves `node_id`.
pub fn has_successor(routes: &[Route], node_id: &str) -> bool {
    routes.iter().any(|r| r.source == node_id)
}

/// Status a lead takes after a successful step on `node_id`.
pub fn status_after_success(routes: &[Route], node_id: &str) -> LeadStatus {
    if has_successor(routes, node_id) {
        LeadStatus::Advancing
    } else {
        LeadStatus::Finished
    }
}

/// Schedules the step that follows a node for a batch of leads.
pub struct FlowLauncher {
    flows: Arc<dyn FlowGraphStore>,
    leads: Arc<dyn LeadStateStore>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl FlowLauncher {
    pub fn new(
        flows: Arc<dyn FlowGraphStore>,
        leads: Arc<dyn LeadStateStore>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            flows,
            leads,
            dispatcher,
        }
    }

    /// Publish one step message per lead for the route leaving `from_node`.
    pub async fn publish(
        &self,
        user_id: &str,
        flow_id: &str,
        from_node: &str,
        lead_ids: &[String],
    ) -> Result<Vec<StepMessage>> {
        let routes = self.flows.get_routes(flow_id).await?;
        let route = routes
            .iter()
            .find(|r| r.source == from_node)
            .ok_or_else(|| {
                LeadflowError::validation(format!(
                    "Node '{from_node}' has no outgoing route in flow {flow_id}"
                ))
            })?;
        // The target must exist before anything is queued.
        self.flows.get_node(flow_id, &route.target).await?;

        let mut published = Vec::with_capacity(lead_ids.len());
        for lead_id in lead_ids {
            let lead = self.leads.get_lead(lead_id).await?;
            let mut message = StepMessage::new(&lead.id, flow_id, Some(user_id), &route.target)?;
            message.phone_number = lead.phone().map(String::from);
            self.dispatcher.schedule(message.clone(), Duration::ZERO).await?;
            tracing::info!(
                "📤 Published {} for lead {} → {}",
                message.kind,
                lead.id,
                message.routing_key()
            );
            published.push(message);
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteStore;
    use crate::queue::SqliteQueue;
    use leadflow_core::{Flow, Lead, Node, StepKind};

    fn flow() -> Flow {
        Flow {
            id: "f1".into(),
            name: "demo".into(),
            owner: Some("u1".into()),
            nodes: vec![
                Node { id: "preVerify_1".into(), settings: serde_json::json!({}) },
                Node { id: "sendWebhook_2".into(), settings: serde_json::json!({}) },
            ],
            routes: vec![Route::new("start", "preVerify_1"), Route::new("preVerify_1", "sendWebhook_2")],
        }
    }

    #[test]
    fn test_status_after_success() {
        let routes = vec![Route::new("A", "B")];
        assert_eq!(status_after_success(&routes, "A"), LeadStatus::Advancing);
        assert_eq!(status_after_success(&routes, "B"), LeadStatus::Finished);
        assert_eq!(status_after_success(&[], "A"), LeadStatus::Finished);
    }

    #[tokio::test]
    async fn test_publish_schedules_successor() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.save_flow(&flow()).unwrap();
        store
            .save_lead(&Lead::new("l1", "Acme", serde_json::json!({"phone": "+1555"})))
            .unwrap();
        let queue = Arc::new(SqliteQueue::open_in_memory(Duration::from_secs(60)).unwrap());

        let launcher = FlowLauncher::new(store.clone(), store.clone(), queue.clone());
        let sent = launcher
            .publish("u1", "f1", "start", &["l1".to_string()])
            .await
            .unwrap();

        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, StepKind::QualificationCheck);
        assert_eq!(sent[0].phone_number.as_deref(), Some("+1555"));
        let delivery = queue.claim(StepKind::QualificationCheck).unwrap().unwrap();
        assert_eq!(delivery.envelope.data.lead_id, "l1");
        assert_eq!(delivery.envelope.routing_key, "u1.f1.preVerify_1");
    }

    #[tokio::test]
    async fn test_publish_unknown_source_node() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.save_flow(&flow()).unwrap();
        let queue = Arc::new(SqliteQueue::open_in_memory(Duration::from_secs(60)).unwrap());
        let launcher = FlowLauncher::new(store.clone(), store.clone(), queue);

        let err = launcher
            .publish("u1", "f1", "sendWebhook_2", &["l1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, LeadflowError::Validation(_)));
    }
}
