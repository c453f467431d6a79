//! Task lifecycle controller: the wrapper every step execution runs through.
//!
//! ```text
//! handle(msg)
//!   ├── attempt 0 → before_start: lead ← Running @ targetNode
//!   ├── executor.execute(msg)
//!   ├── Ok  → on_success: Advancing | Finished (topology only)
//!   └── Err → on_failure:
//!               infrastructure → abort (Err), delivery stays un-acked
//!               retryable + budget left → Dispatcher::schedule(attempt + 1)
//!               otherwise → lead ← Failed + error record
//! ```
//!
//! Status and error writes are guarded on the lead still sitting on the
//! step's node. A late retry or duplicate delivery of an earlier step finds
//! the lead elsewhere and leaves it untouched (`Superseded`).
//!
//! The controller holds no mutable state; everything it does is visible as a
//! store write or a dispatcher call.

use std::sync::Arc;
use std::time::Duration;

use leadflow_core::traits::{Dispatcher, FlowGraphStore, LeadStateStore, StepRegistry};
use leadflow_core::{
    ErrorRecord, LeadStatus, LeadUpdate, LeadflowError, Result, StepKind, StepMessage, StepOutput,
};

use crate::retry::RetryPolicy;
use crate::workflow::status_after_success;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Lead moved to Advancing; a successor node exists.
    Advancing,
    /// Lead reached a terminal node.
    Finished,
    /// Outbound call placed; its completion arrives through a separate callback.
    AwaitingCallback,
    /// Retry scheduled with the given attempt number and delay.
    Rescheduled { attempt: u32, delay: Duration },
    /// Lead marked Failed with an error record.
    Failed,
    /// The lead had already moved to another node; nothing was written.
    Superseded,
}

pub struct TaskLifecycleController {
    leads: Arc<dyn LeadStateStore>,
    flows: Arc<dyn FlowGraphStore>,
    dispatcher: Arc<dyn Dispatcher>,
    steps: StepRegistry,
    policy: RetryPolicy,
}

impl TaskLifecycleController {
    pub fn new(
        leads: Arc<dyn LeadStateStore>,
        flows: Arc<dyn FlowGraphStore>,
        dispatcher: Arc<dyn Dispatcher>,
        steps: StepRegistry,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            leads,
            flows,
            dispatcher,
            steps,
            policy,
        }
    }

    /// Run one delivery end to end.
    ///
    /// Returns `Err` only when the lifecycle itself could not be carried out
    /// (store or dispatcher unavailable, or the lead vanished); step failures
    /// are settled and reported as an outcome.
    pub async fn handle(&self, message: &StepMessage) -> Result<TaskOutcome> {
        if !message.is_retry() {
            self.before_start(message).await?;
        }

        let executor = self.steps.get(message.kind);
        match executor.execute(message).await {
            Ok(output) => self.on_success(message, &output).await,
            Err(e) => self.on_failure(message, e).await,
        }
    }

    /// Transition 1: `* → Running`, current node ← target node.
    pub async fn before_start(&self, message: &StepMessage) -> Result<()> {
        self.leads
            .update_status_and_node(&message.lead_id, LeadStatus::Running, &message.target_node)
            .await
            .map_err(|e| match e {
                LeadflowError::NotFound(_) => e,
                other => LeadflowError::infra(format!("before_start write failed: {other}")),
            })?;
        tracing::info!(
            "▶️ {} started: lead {} @ {} (attempt {})",
            message.kind,
            message.lead_id,
            message.target_node,
            message.attempt
        );
        Ok(())
    }

    /// Transition 2. Depends only on the flow topology, so re-running it for
    /// the same message lands on the same status.
    pub async fn on_success(
        &self,
        message: &StepMessage,
        output: &StepOutput,
    ) -> Result<TaskOutcome> {
        let routes = match self.flows.get_routes(&message.flow_id).await {
            Ok(routes) => routes,
            Err(e) if e.is_infrastructure() => return Err(e),
            Err(e) => return self.fail(message, &e).await,
        };
        let status = status_after_success(&routes, &message.target_node);

        match output {
            StepOutput::NoSlot => tracing::info!(
                "📭 No free slot for lead {} @ {}",
                message.lead_id,
                message.target_node
            ),
            StepOutput::Verdict { passed, reason } => tracing::info!(
                "🔎 Lead {} qualification: {} {}",
                message.lead_id,
                if *passed { "passed" } else { "rejected" },
                reason.as_deref().unwrap_or_default()
            ),
            StepOutput::Completed(_) => {}
        }

        if message.kind == StepKind::OutboundCall && status == LeadStatus::Advancing {
            tracing::info!(
                "📞 Call placed for lead {} @ {}, awaiting callback",
                message.lead_id,
                message.target_node
            );
            return Ok(TaskOutcome::AwaitingCallback);
        }

        if !self.settle(message, LeadUpdate::status(status)).await? {
            return Ok(TaskOutcome::Superseded);
        }
        tracing::info!(
            "✅ {} succeeded: lead {} @ {} → {}",
            message.kind,
            message.lead_id,
            message.target_node,
            status
        );
        Ok(match status {
            LeadStatus::Advancing => TaskOutcome::Advancing,
            _ => TaskOutcome::Finished,
        })
    }

    /// Transitions 3 and 4.
    pub async fn on_failure(
        &self,
        message: &StepMessage,
        error: LeadflowError,
    ) -> Result<TaskOutcome> {
        if error.is_infrastructure() {
            tracing::error!(
                "🧱 {} aborted for lead {}: {}",
                message.kind,
                message.lead_id,
                error
            );
            return Err(error);
        }

        if error.is_retryable() && self.policy.can_retry(message.attempt) {
            let delay = self.policy.delay(message.kind, message.attempt, &error);
            let retry = message.next_attempt();
            let attempt = retry.attempt;
            self.dispatcher.schedule(retry, delay).await?;
            tracing::warn!(
                "🔄 {} failed for lead {} (attempt {}/{}), retrying in {:?}: {}",
                message.kind,
                message.lead_id,
                attempt,
                self.policy.max_retries,
                delay,
                error
            );
            return Ok(TaskOutcome::Rescheduled { attempt, delay });
        }

        self.fail(message, &error).await
    }

    async fn fail(&self, message: &StepMessage, error: &LeadflowError) -> Result<TaskOutcome> {
        let record = ErrorRecord {
            status: false,
            message: format!("Task {} failed: {}", message.kind, error),
            task_id: message.id.clone(),
            stack_trace: error.trace(),
        };
        if !self.settle(message, LeadUpdate::failed(record)).await? {
            return Ok(TaskOutcome::Superseded);
        }
        tracing::error!(
            "❌ {} failed for lead {} @ {} after {} attempt(s): {}",
            message.kind,
            message.lead_id,
            message.target_node,
            message.attempt.saturating_add(1),
            error
        );
        Ok(TaskOutcome::Failed)
    }

    /// Write `update` only if the lead is still on the step's node.
    async fn settle(&self, message: &StepMessage, update: LeadUpdate) -> Result<bool> {
        let applied = self
            .leads
            .update_lead_on_node(&message.lead_id, &message.target_node, update)
            .await?;
        if !applied {
            tracing::warn!(
                "⏭️ {} for lead {} @ {} is stale, lead has moved on",
                message.kind,
                message.lead_id,
                message.target_node
            );
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteStore;
    use crate::queue::SqliteQueue;
    use async_trait::async_trait;
    use leadflow_core::traits::StepExecutor;
    use leadflow_core::{Flow, Lead, Node, RemoteErrorKind, Route};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Executor replaying scripted results; succeeds once the script runs out.
    struct Scripted {
        kind: StepKind,
        script: Mutex<VecDeque<Result<StepOutput>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(kind: StepKind, script: Vec<Result<StepOutput>>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl StepExecutor for Scripted {
        fn kind(&self) -> StepKind {
            self.kind
        }

        async fn execute(&self, _message: &StepMessage) -> Result<StepOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(StepOutput::Completed(serde_json::json!({"ok": true}))))
        }
    }

    /// Dispatcher that records what would have been queued.
    #[derive(Default)]
    struct Recorder {
        scheduled: Mutex<Vec<(StepMessage, Duration)>>,
    }

    #[async_trait]
    impl Dispatcher for Recorder {
        async fn schedule(&self, message: StepMessage, delay: Duration) -> Result<()> {
            self.scheduled.lock().unwrap().push((message, delay));
            Ok(())
        }
    }

    struct Down;

    #[async_trait]
    impl Dispatcher for Down {
        async fn schedule(&self, _message: StepMessage, _delay: Duration) -> Result<()> {
            Err(LeadflowError::infra("broker unreachable"))
        }
    }

    fn timeout() -> LeadflowError {
        LeadflowError::remote("webhook", RemoteErrorKind::Timeout, "timed out")
    }

    fn store() -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .save_flow(&Flow {
                id: "f1".into(),
                name: "demo".into(),
                owner: Some("u1".into()),
                nodes: ["aiCall_1", "sendWebhook_2", "aiCall_3"]
                    .iter()
                    .map(|id| Node { id: id.to_string(), settings: serde_json::json!({}) })
                    .collect(),
                routes: vec![
                    Route::new("aiCall_1", "sendWebhook_2"),
                    Route::new("sendWebhook_2", "aiCall_3"),
                ],
            })
            .unwrap();
        store.save_lead(&Lead::new("l1", "Acme", serde_json::json!({}))).unwrap();
        Arc::new(store)
    }

    fn controller(
        store: &Arc<SqliteStore>,
        dispatcher: Arc<dyn Dispatcher>,
        executor: Arc<Scripted>,
    ) -> TaskLifecycleController {
        let steps = StepRegistry {
            outbound_call: executor.clone(),
            qualification: executor.clone(),
            calendar: executor.clone(),
            webhook: executor,
        };
        TaskLifecycleController::new(
            store.clone(),
            store.clone(),
            dispatcher,
            steps,
            RetryPolicy::default(),
        )
    }

    fn message(node: &str) -> StepMessage {
        StepMessage::new("l1", "f1", Some("u1"), node).unwrap()
    }

    #[tokio::test]
    async fn test_success_with_successor_advances() {
        let store = store();
        let exec = Scripted::new(StepKind::WebhookNotify, vec![]);
        let ctl = controller(&store, Arc::new(Recorder::default()), exec);

        let outcome = ctl.handle(&message("sendWebhook_2")).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Advancing);
        let lead = store.get_lead("l1").await.unwrap();
        assert_eq!(lead.status, LeadStatus::Advancing);
        assert_eq!(lead.current_node.as_deref(), Some("sendWebhook_2"));
    }

    #[tokio::test]
    async fn test_terminal_node_finishes() {
        let store = store();
        let exec = Scripted::new(StepKind::OutboundCall, vec![]);
        let ctl = controller(&store, Arc::new(Recorder::default()), exec);

        let outcome = ctl.handle(&message("aiCall_3")).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Finished);
        assert_eq!(store.get_lead("l1").await.unwrap().status, LeadStatus::Finished);
    }

    #[tokio::test]
    async fn test_call_with_successor_stays_running() {
        let store = store();
        let exec = Scripted::new(StepKind::OutboundCall, vec![]);
        let ctl = controller(&store, Arc::new(Recorder::default()), exec);

        let outcome = ctl.handle(&message("aiCall_1")).await.unwrap();
        assert_eq!(outcome, TaskOutcome::AwaitingCallback);
        let lead = store.get_lead("l1").await.unwrap();
        assert_eq!(lead.status, LeadStatus::Running);
        assert_eq!(lead.current_node.as_deref(), Some("aiCall_1"));
    }

    #[tokio::test]
    async fn test_on_success_is_idempotent() {
        let store = store();
        let exec = Scripted::new(StepKind::WebhookNotify, vec![]);
        let ctl = controller(&store, Arc::new(Recorder::default()), exec);
        let msg = message("sendWebhook_2");
        let output = StepOutput::Completed(serde_json::json!({}));

        ctl.before_start(&msg).await.unwrap();
        let first = ctl.on_success(&msg, &output).await.unwrap();
        let after_first = store.get_lead("l1").await.unwrap();
        let second = ctl.on_success(&msg, &output).await.unwrap();
        let after_second = store.get_lead("l1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(after_first.status, after_second.status);
        assert_eq!(after_first.current_node, after_second.current_node);
    }

    #[tokio::test]
    async fn test_retryable_failure_reschedules_same_message() {
        let store = store();
        let recorder = Arc::new(Recorder::default());
        let exec = Scripted::new(StepKind::WebhookNotify, vec![Err(timeout())]);
        let ctl = controller(&store, recorder.clone(), exec);
        let msg = message("sendWebhook_2");

        let outcome = ctl.handle(&msg).await.unwrap();
        assert_eq!(
            outcome,
            TaskOutcome::Rescheduled { attempt: 1, delay: Duration::from_secs(5) }
        );
        let scheduled = recorder.scheduled.lock().unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].0.id, msg.id);
        assert_eq!(scheduled[0].0.attempt, 1);
        drop(scheduled);
        assert_eq!(store.get_lead("l1").await.unwrap().status, LeadStatus::Running);
    }

    #[tokio::test]
    async fn test_fourth_failure_marks_failed() {
        let store = store();
        let queue = Arc::new(SqliteQueue::open_in_memory(Duration::from_secs(60)).unwrap());
        let exec = Scripted::new(
            StepKind::WebhookNotify,
            (0..4).map(|_| Err(timeout())).collect(),
        );
        let ctl = controller(&store, queue.clone(), exec.clone());

        let mut msg = message("sendWebhook_2");
        let mut outcomes = Vec::new();
        for _ in 0..4 {
            let outcome = ctl.handle(&msg).await.unwrap();
            outcomes.push(outcome);
            if let TaskOutcome::Rescheduled { .. } = outcome {
                msg = msg.next_attempt();
            }
        }

        assert!(matches!(outcomes[2], TaskOutcome::Rescheduled { attempt: 3, .. }));
        assert_eq!(outcomes[3], TaskOutcome::Failed);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 4);
        assert_eq!(queue.pending(StepKind::WebhookNotify).unwrap(), 3);

        let lead = store.get_lead("l1").await.unwrap();
        assert_eq!(lead.status, LeadStatus::Failed);
        assert_eq!(lead.current_node.as_deref(), Some("sendWebhook_2"));
        let error = lead.error.unwrap();
        assert!(!error.status);
        assert_eq!(error.task_id, msg.id);
        assert!(error.message.starts_with("Task sendWebhook failed:"));
        assert!(error.stack_trace.chars().count() <= leadflow_core::error::MAX_TRACE_CHARS);
    }

    #[tokio::test]
    async fn test_fatal_failure_skips_retry() {
        let store = store();
        let recorder = Arc::new(Recorder::default());
        let exec = Scripted::new(
            StepKind::WebhookNotify,
            vec![Err(LeadflowError::validation("webhookUrl is required"))],
        );
        let ctl = controller(&store, recorder.clone(), exec);

        let outcome = ctl.handle(&message("sendWebhook_2")).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Failed);
        assert!(recorder.scheduled.lock().unwrap().is_empty());
        let lead = store.get_lead("l1").await.unwrap();
        assert!(lead.error.unwrap().message.contains("webhookUrl is required"));
    }

    #[tokio::test]
    async fn test_retry_does_not_rerun_before_start() {
        let store = store();
        // Lead already moved on; a retry must not drag current_node back.
        store
            .update_status_and_node("l1", LeadStatus::Running, "aiCall_3")
            .await
            .unwrap();
        let exec = Scripted::new(StepKind::WebhookNotify, vec![Err(timeout())]);
        let ctl = controller(&store, Arc::new(Recorder::default()), exec);

        let retry = message("sendWebhook_2").next_attempt();
        ctl.handle(&retry).await.unwrap();
        let lead = store.get_lead("l1").await.unwrap();
        assert_eq!(lead.current_node.as_deref(), Some("aiCall_3"));
    }

    #[tokio::test]
    async fn test_late_success_leaves_moved_lead_alone() {
        let store = store();
        store
            .update_status_and_node("l1", LeadStatus::Running, "aiCall_3")
            .await
            .unwrap();
        let exec = Scripted::new(StepKind::WebhookNotify, vec![]);
        let ctl = controller(&store, Arc::new(Recorder::default()), exec.clone());

        let retry = message("sendWebhook_2").next_attempt();
        let outcome = ctl.handle(&retry).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Superseded);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
        let lead = store.get_lead("l1").await.unwrap();
        assert_eq!(lead.status, LeadStatus::Running);
        assert_eq!(lead.current_node.as_deref(), Some("aiCall_3"));
    }

    #[tokio::test]
    async fn test_late_exhaustion_leaves_moved_lead_alone() {
        let store = store();
        store
            .update_status_and_node("l1", LeadStatus::Running, "aiCall_3")
            .await
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let exec = Scripted::new(StepKind::WebhookNotify, vec![Err(timeout())]);
        let ctl = controller(&store, recorder.clone(), exec);

        let mut last = message("sendWebhook_2");
        for _ in 0..3 {
            last = last.next_attempt();
        }
        let outcome = ctl.handle(&last).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Superseded);
        assert!(recorder.scheduled.lock().unwrap().is_empty());
        let lead = store.get_lead("l1").await.unwrap();
        assert_eq!(lead.status, LeadStatus::Running);
        assert_eq!(lead.current_node.as_deref(), Some("aiCall_3"));
        assert!(lead.error.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_first_delivery_after_move_is_stale() {
        let store = store();
        let exec = Scripted::new(StepKind::WebhookNotify, vec![]);
        let ctl = controller(&store, Arc::new(Recorder::default()), exec);
        let msg = message("sendWebhook_2");

        assert_eq!(ctl.handle(&msg).await.unwrap(), TaskOutcome::Advancing);
        ctl.before_start(&message("aiCall_3")).await.unwrap();

        // Redelivered copy of the settled message: execution reruns, the
        // status write on the old node does not.
        let outcome = ctl.on_success(&msg, &StepOutput::Completed(serde_json::json!({}))).await;
        assert_eq!(outcome.unwrap(), TaskOutcome::Superseded);
        let lead = store.get_lead("l1").await.unwrap();
        assert_eq!(lead.status, LeadStatus::Running);
        assert_eq!(lead.current_node.as_deref(), Some("aiCall_3"));
    }

    #[tokio::test]
    async fn test_failed_log_survives_huge_attempt() {
        let store = store();
        let exec = Scripted::new(StepKind::WebhookNotify, vec![Err(timeout())]);
        let ctl = controller(&store, Arc::new(Recorder::default()), exec);
        ctl.before_start(&message("sendWebhook_2")).await.unwrap();

        let mut msg = message("sendWebhook_2");
        msg.attempt = u32::MAX;
        assert_eq!(ctl.handle(&msg).await.unwrap(), TaskOutcome::Failed);
        assert_eq!(store.get_lead("l1").await.unwrap().status, LeadStatus::Failed);
    }

    #[tokio::test]
    async fn test_infrastructure_failure_aborts_without_charge() {
        let store = store();
        let exec = Scripted::new(StepKind::WebhookNotify, vec![Err(timeout())]);
        let ctl = controller(&store, Arc::new(Down), exec);

        let err = ctl.handle(&message("sendWebhook_2")).await.unwrap_err();
        assert!(err.is_infrastructure());
        let lead = store.get_lead("l1").await.unwrap();
        assert_eq!(lead.status, LeadStatus::Running);
        assert!(lead.error.is_none());
    }

    #[tokio::test]
    async fn test_missing_lead_aborts_before_execution() {
        let store = store();
        let exec = Scripted::new(StepKind::WebhookNotify, vec![]);
        let ctl = controller(&store, Arc::new(Recorder::default()), exec.clone());

        let mut msg = message("sendWebhook_2");
        msg.lead_id = "ghost".into();
        let err = ctl.handle(&msg).await.unwrap_err();
        assert!(matches!(err, LeadflowError::NotFound(_)));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_slot_is_success() {
        let store = store();
        let exec = Scripted::new(StepKind::CalendarBooking, vec![Ok(StepOutput::NoSlot)]);
        let ctl = controller(&store, Arc::new(Recorder::default()), exec);

        let mut msg = message("sendWebhook_2");
        msg.kind = StepKind::CalendarBooking;
        msg.target_node = "aiCall_3".into();
        let outcome = ctl.handle(&msg).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Finished);
        assert!(store.get_lead("l1").await.unwrap().error.is_none());
    }
}
