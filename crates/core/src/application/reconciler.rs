// Batch Reconciler
//
// Compensating re-aggregation: a batch whose outcome write was lost (store
// error, contention budget spent, crash between job write and aggregation)
// is repaired from its job rows. Optionally fails jobs that were never picked
// up, and counts jobs that were never created as failed, so an abandoned batch
// still converges.

use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::application::aggregator::BatchAggregator;
use crate::domain::{Batch, ErrorDetail, Job, JobStatus};
use crate::error::{AppError, Result};
use crate::port::{JobStore, TimeProvider};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub batches_checked: u32,
    pub outcomes_replayed: u32,
    pub jobs_abandoned: u32,
    /// Batch slots with no job row, counted as failed
    pub slots_abandoned: u32,
    pub batches_finished: u32,
}

impl AddAssign for ReconcileReport {
    fn add_assign(&mut self, other: Self) {
        self.batches_checked += other.batches_checked;
        self.outcomes_replayed += other.outcomes_replayed;
        self.jobs_abandoned += other.jobs_abandoned;
        self.slots_abandoned += other.slots_abandoned;
        self.batches_finished += other.batches_finished;
    }
}

pub struct BatchReconciler {
    store: Arc<dyn JobStore>,
    aggregator: Arc<BatchAggregator>,
    time_provider: Arc<dyn TimeProvider>,
    stale_after: Option<Duration>,
}

impl BatchReconciler {
    pub fn new(
        store: Arc<dyn JobStore>,
        aggregator: Arc<BatchAggregator>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store,
            aggregator,
            time_provider,
            stale_after: None,
        }
    }

    /// Fail still-pending jobs of batches older than `stale_after`, and count
    /// their never-created jobs as failed
    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub async fn reconcile(&self, batch_id: &str) -> Result<ReconcileReport> {
        let batch = self
            .store
            .find_batch(batch_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("batch {}", batch_id)))?;

        let mut report = ReconcileReport {
            batches_checked: 1,
            ..ReconcileReport::default()
        };
        if batch.is_terminal() {
            return Ok(report);
        }

        let now = self.time_provider.now_millis();
        let stale = self
            .stale_after
            .is_some_and(|after| now - batch.created_at > after.as_millis() as i64);

        let jobs = self.store.find_jobs_by_batch(&batch.id).await?;
        let missing = batch.total.saturating_sub(jobs.len() as u32);

        for job in jobs {
            let success = match job.status {
                JobStatus::Completed => true,
                JobStatus::Failed => false,
                JobStatus::Pending if stale => {
                    self.abandon(&job, now).await?;
                    report.jobs_abandoned += 1;
                    false
                }
                _ => continue,
            };

            if job.status.is_terminal() && is_reflected(&batch, &job.id, success) {
                continue;
            }

            let outcome = self.aggregator.record_outcome(&batch.id, &job.id, success).await?;
            report.outcomes_replayed += 1;
            if outcome.finished_now {
                report.batches_finished += 1;
            }
        }

        if stale && missing > 0 {
            warn!(
                batch_id = %batch.id,
                missing = missing,
                total = batch.total,
                "Batch has jobs that were never created, counting them as failed"
            );
            let outcome = self.aggregator.record_missing(&batch.id, missing).await?;
            report.slots_abandoned = missing;
            if outcome.finished_now {
                report.batches_finished += 1;
            }
        }

        if report.outcomes_replayed > 0 || report.slots_abandoned > 0 {
            info!(
                batch_id = %batch.id,
                replayed = report.outcomes_replayed,
                abandoned = report.jobs_abandoned,
                missing = report.slots_abandoned,
                finished = report.batches_finished > 0,
                "Batch reconciled"
            );
        }
        Ok(report)
    }

    /// Reconcile every open batch; one failing batch does not stop the sweep
    pub async fn sweep(&self) -> Result<ReconcileReport> {
        let mut total = ReconcileReport::default();
        for batch in self.store.find_open_batches().await? {
            match self.reconcile(&batch.id).await {
                Ok(report) => total += report,
                Err(e) => warn!(batch_id = %batch.id, error = %e, "Failed to reconcile batch"),
            }
        }
        debug!(
            checked = total.batches_checked,
            replayed = total.outcomes_replayed,
            "Reconciliation sweep finished"
        );
        Ok(total)
    }

    async fn abandon(&self, job: &Job, now: i64) -> Result<()> {
        let after = self.stale_after.unwrap_or_default();
        let detail = ErrorDetail::new(
            "Abandoned",
            format!("job was not picked up within {}s", after.as_secs()),
            now,
            0,
        );
        warn!(job_id = %job.id, batch_id = ?job.batch_id, "Failing abandoned job");
        // Keeps the pending -> in-progress -> failed chain intact
        self.store.set_job_running(&job.id, now).await?;
        self.store.fail_job(&job.id, &detail, 0).await
    }
}

fn is_reflected(batch: &Batch, job_id: &str, success: bool) -> bool {
    if success {
        batch.completed.contains(job_id)
    } else {
        batch.failed.contains(job_id)
    }
}
