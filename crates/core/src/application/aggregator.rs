// Batch Aggregator
//
// Merges terminal job outcomes into the owning batch with an optimistic
// concurrency loop: read the batch, apply the set-based merge, and
// compare-and-swap on the version column. A lost race rereads and reapplies,
// so concurrent jobs of one batch never overwrite each other's outcome.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::application::dispatcher::constants::{CAS_BASE_DELAY, CAS_MAX_ATTEMPTS};
use crate::application::retry::Backoff;
use crate::domain::{Batch, BatchStatus, OutcomeEffect};
use crate::error::{AppError, Result};
use crate::port::{JobStore, Notification, Notifier, TimeProvider};

/// Batch state after one outcome was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub is_terminal: bool,
    pub status: BatchStatus,
    /// True only for the single call that made the batch terminal
    pub finished_now: bool,
}

impl BatchOutcome {
    fn of(batch: &Batch, finished_now: bool) -> Self {
        Self {
            is_terminal: batch.is_terminal(),
            status: batch.status,
            finished_now,
        }
    }
}

pub struct BatchAggregator {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    time_provider: Arc<dyn TimeProvider>,
    max_attempts: u32,
    backoff: Backoff,
}

impl BatchAggregator {
    pub fn new(
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn Notifier>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store,
            notifier,
            time_provider,
            max_attempts: CAS_MAX_ATTEMPTS,
            backoff: Backoff::Exponential(CAS_BASE_DELAY),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = Backoff::Exponential(base_delay);
        self
    }

    /// Record a terminal job outcome against its batch.
    ///
    /// Idempotent: reporting the same outcome again changes nothing, reporting
    /// a different outcome for the same job moves it between sets. The
    /// transition to a terminal status (and its notification) happens exactly
    /// once per batch.
    pub async fn record_outcome(
        &self,
        batch_id: &str,
        job_id: &str,
        success: bool,
    ) -> Result<BatchOutcome> {
        self.merge(batch_id, job_id, |batch, now| batch.apply_outcome(job_id, success, now))
            .await
    }

    /// Count `slots` jobs of the batch that were never created as failed
    pub async fn record_missing(&self, batch_id: &str, slots: u32) -> Result<BatchOutcome> {
        let label = format!("{} missing slots", slots);
        self.merge(batch_id, &label, |batch, now| batch.abandon_missing(slots, now))
            .await
    }

    async fn merge<F>(&self, batch_id: &str, label: &str, apply: F) -> Result<BatchOutcome>
    where
        F: Fn(&mut Batch, i64) -> OutcomeEffect,
    {
        for attempt in 1..=self.max_attempts {
            let mut batch = self
                .store
                .find_batch(batch_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("batch {}", batch_id)))?;

            let expected_version = batch.version;
            let effect = apply(&mut batch, self.time_provider.now_millis());

            if effect == OutcomeEffect::Unchanged {
                debug!(batch_id = %batch_id, job_id = %label, "Outcome already reflected in batch");
                return Ok(BatchOutcome::of(&batch, false));
            }

            if self.store.swap_batch(&batch, expected_version).await? {
                return Ok(self.after_write(&batch, label, effect).await);
            }

            let delay = self.backoff.delay(attempt);
            debug!(
                batch_id = %batch_id,
                job_id = %label,
                attempt = %attempt,
                delay_ms = %delay.as_millis(),
                "Batch version conflict, retrying"
            );
            tokio::time::sleep(delay).await;
        }

        warn!(
            batch_id = %batch_id,
            job_id = %label,
            attempts = %self.max_attempts,
            "Batch still contended, giving up"
        );
        Err(AppError::Conflict(format!(
            "batch {} still contended after {} attempts",
            batch_id, self.max_attempts
        )))
    }

    async fn after_write(&self, batch: &Batch, job_id: &str, effect: OutcomeEffect) -> BatchOutcome {
        match effect {
            OutcomeEffect::Finished(status) => {
                info!(
                    batch_id = %batch.id,
                    status = %status,
                    completed = batch.completed.len(),
                    failed = batch.failed.len(),
                    total = batch.total,
                    duration_ms = ?batch.duration_ms,
                    "Batch finished"
                );
                self.notifier
                    .notify(&Notification::BatchFinished {
                        batch_id: batch.id.clone(),
                        name: batch.name.clone(),
                        status,
                        total: batch.total,
                        completed: batch.completed.len() as u32,
                        failed: batch.failed.len() as u32,
                        duration_ms: batch.duration_ms.unwrap_or_default(),
                    })
                    .await;
                BatchOutcome::of(batch, true)
            }
            _ => {
                debug!(
                    batch_id = %batch.id,
                    job_id = %job_id,
                    processed = batch.processed(),
                    total = batch.total,
                    "Batch outcome recorded"
                );
                BatchOutcome::of(batch, false)
            }
        }
    }
}
