//! Dispatcher trait: message-broker-backed scheduling of steps.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::types::StepMessage;

/// Schedules a step message for delivery to the workers of its kind.
///
/// Delivery is at-least-once. Retries of the same message are delivered in
/// delay-expiry order.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn schedule(&self, message: StepMessage, delay: Duration) -> Result<()>;
}
