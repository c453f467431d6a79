//! Step executor trait and the registry holding one executor per step kind.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{StepKind, StepMessage, StepOutput};

/// Performs exactly one externally visible side effect for one node type.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn kind(&self) -> StepKind;

    async fn execute(&self, message: &StepMessage) -> Result<StepOutput>;
}

/// One executor per [`StepKind`], selected by the kind carried in the message.
#[derive(Clone)]
pub struct StepRegistry {
    pub outbound_call: Arc<dyn StepExecutor>,
    pub qualification: Arc<dyn StepExecutor>,
    pub calendar: Arc<dyn StepExecutor>,
    pub webhook: Arc<dyn StepExecutor>,
}

impl StepRegistry {
    pub fn get(&self, kind: StepKind) -> &Arc<dyn StepExecutor> {
        match kind {
            StepKind::OutboundCall => &self.outbound_call,
            StepKind::QualificationCheck => &self.qualification,
            StepKind::CalendarBooking => &self.calendar,
            StepKind::WebhookNotify => &self.webhook,
        }
    }
}
