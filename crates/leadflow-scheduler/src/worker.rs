//! Worker pool: independent consumers per step kind.
//!
//! Each worker ticks on a `tokio::time::interval`, drains ready deliveries of
//! its kind one at a time and sleeps again. A worker is occupied by exactly
//! one step while it runs.

use std::sync::Arc;
use std::time::Duration;

use leadflow_core::config::WorkerConfig;
use leadflow_core::{Result, StepKind};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::lifecycle::{TaskLifecycleController, TaskOutcome};
use crate::queue::SqliteQueue;

pub struct WorkerPool {
    queue: Arc<SqliteQueue>,
    controller: Arc<TaskLifecycleController>,
    pool_size: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<SqliteQueue>,
        controller: Arc<TaskLifecycleController>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            queue,
            controller,
            pool_size: config.pool_size.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }

    /// Claim and settle one delivery of `kind`. `Ok(None)` when the queue is idle.
    pub async fn process_next(&self, kind: StepKind) -> Result<Option<TaskOutcome>> {
        let Some(delivery) = self.queue.claim(kind)? else {
            return Ok(None);
        };
        let message = delivery.message();
        tracing::debug!(
            "📬 {} delivery #{} for lead {} (delivery {}, attempt {})",
            kind,
            delivery.seq,
            message.lead_id,
            delivery.deliveries,
            message.attempt
        );

        match self.controller.handle(message).await {
            Ok(outcome) => {
                self.queue.ack(&delivery)?;
                Ok(Some(outcome))
            }
            Err(e) if e.is_infrastructure() => {
                // Un-acked: the lease runs out and the same delivery comes back.
                tracing::warn!(
                    "⏳ {} for lead {} left for redelivery: {}",
                    kind,
                    message.lead_id,
                    e
                );
                Err(e)
            }
            Err(e) => {
                tracing::error!(
                    "🗑️ Dropping {} for lead {}: {}",
                    kind,
                    message.lead_id,
                    e
                );
                self.queue.ack(&delivery)?;
                Ok(None)
            }
        }
    }

    /// Run every worker until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut workers = JoinSet::new();
        for kind in StepKind::ALL {
            for index in 0..self.pool_size {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                workers.spawn(async move { pool.worker_loop(kind, index, shutdown).await });
            }
        }
        tracing::info!(
            "👷 Worker pool started: {} worker(s) × {} step kinds",
            self.pool_size,
            StepKind::ALL.len()
        );

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!("💥 Worker task crashed: {e}");
            }
        }
        tracing::info!("🛑 Worker pool stopped");
    }

    async fn worker_loop(&self, kind: StepKind, index: usize, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        tracing::debug!("🔁 Worker {}#{} consuming {}", kind, index, kind.queue_name());
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.drain(kind).await;
                }
            }
        }
    }

    async fn drain(&self, kind: StepKind) {
        loop {
            match self.process_next(kind).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("⚠️ {} worker backing off: {}", kind, e);
                    break;
                }
            }
        }
    }
}
