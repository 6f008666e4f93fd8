// Scheduling Publisher
//
// Expands a scan request into one batch + N pending jobs and publishes one
// job message per job. Write order is batch, then job row, then message, so
// any consumer that sees a message can find its job and the batch total.

use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{error, info, warn};

use crate::application::dispatcher::constants::SCHEDULED_BATCH_NAME;
use crate::domain::{
    Batch, BatchId, Job, JobId, JobMessage, RuleSelection, ScheduledRequest, Target, TargetId,
    TargetSelector,
};
use crate::error::{AppError, Result};
use crate::port::{IdProvider, JobStore, QueueTransport, ScheduleStore, TargetCatalog, TimeProvider};

/// Result of one fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub batch_id: BatchId,
    pub total: u32,
    pub published: u32,
    /// Targets that were requested but got no message (unknown id, or a failed write)
    pub failed_targets: Vec<TargetId>,
}

pub struct SchedulingPublisher {
    store: Arc<dyn JobStore>,
    schedules: Arc<dyn ScheduleStore>,
    targets: Arc<dyn TargetCatalog>,
    transport: Arc<dyn QueueTransport>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
}

impl SchedulingPublisher {
    pub fn new(
        store: Arc<dyn JobStore>,
        schedules: Arc<dyn ScheduleStore>,
        targets: Arc<dyn TargetCatalog>,
        transport: Arc<dyn QueueTransport>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store,
            schedules,
            targets,
            transport,
            id_provider,
            time_provider,
        }
    }

    /// Expand a scheduled request. Does not delete it; see `publish_due`.
    pub async fn expand_and_publish(&self, request: &ScheduledRequest) -> Result<PublishReport> {
        let name = request.name.as_deref().unwrap_or(SCHEDULED_BATCH_NAME);
        info!(schedule_id = %request.id, name = %name, "Expanding scheduled request");
        self.submit_batch(name, &request.targets, &request.rules).await
    }

    /// Expand every request due on or before `today`, deleting each one that
    /// expanded. A request that fails to expand is kept for the next run.
    pub async fn publish_due(&self, today: NaiveDate) -> Result<Vec<PublishReport>> {
        let due = self.schedules.due_schedules(today).await?;
        if due.is_empty() {
            return Ok(Vec::new());
        }
        info!(count = due.len(), today = %today, "Publishing due schedules");

        let mut reports = Vec::with_capacity(due.len());
        for request in due {
            match self.expand_and_publish(&request).await {
                Ok(report) => {
                    if let Err(e) = self.schedules.delete_schedule(&request.id).await {
                        // Next run expands it again into a second batch
                        error!(schedule_id = %request.id, error = %e, "Failed to delete expanded schedule");
                    }
                    reports.push(report);
                }
                Err(e) => {
                    warn!(schedule_id = %request.id, error = %e, "Failed to expand schedule, keeping it");
                }
            }
        }
        Ok(reports)
    }

    /// Ad-hoc multi-target scan
    pub async fn submit_batch(
        &self,
        name: &str,
        targets: &TargetSelector,
        rules: &RuleSelection,
    ) -> Result<PublishReport> {
        let (resolved, mut failed_targets) = self.resolve_targets(targets).await?;
        if resolved.is_empty() {
            return Err(AppError::Validation(
                "target selection matched no known targets".to_string(),
            ));
        }

        let now = self.time_provider.now_millis();
        let batch = Batch::new(self.id_provider.generate_id(), name, resolved.len() as u32, now)?;
        self.store.create_batch(&batch).await?;

        let mut published = 0;
        for target in resolved {
            let job = Job::new(
                self.id_provider.generate_id(),
                Some(batch.id.clone()),
                target,
                rules.clone(),
                now,
            );
            match self.create_and_publish(&job).await {
                Ok(()) => published += 1,
                Err(e) => {
                    warn!(
                        batch_id = %batch.id,
                        job_id = %job.id,
                        target = %job.target.host,
                        error = %e,
                        "Failed to publish job, continuing with remaining targets"
                    );
                    failed_targets.push(job.target.id.clone());
                }
            }
        }

        info!(
            batch_id = %batch.id,
            name = %name,
            total = batch.total,
            published = published,
            failed = failed_targets.len(),
            "Batch published"
        );

        Ok(PublishReport {
            batch_id: batch.id,
            total: batch.total,
            published,
            failed_targets,
        })
    }

    /// Ad-hoc single scan without a batch
    pub async fn submit_single(&self, target_id: &str, rules: &RuleSelection) -> Result<JobId> {
        let target = self
            .targets
            .find_targets(&[target_id.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("target {}", target_id)))?;

        let job = Job::new(
            self.id_provider.generate_id(),
            None,
            target,
            rules.clone(),
            self.time_provider.now_millis(),
        );
        self.create_and_publish(&job).await?;
        info!(job_id = %job.id, target = %job.target.host, "Single scan published");
        Ok(job.id)
    }

    async fn create_and_publish(&self, job: &Job) -> Result<()> {
        self.store.create_job(job).await?;
        self.transport.publish(&JobMessage::from_job(job)).await?;
        Ok(())
    }

    /// Known targets plus the requested ids that are unknown
    async fn resolve_targets(&self, selector: &TargetSelector) -> Result<(Vec<Target>, Vec<TargetId>)> {
        match selector {
            TargetSelector::All => Ok((self.targets.all_targets().await?, Vec::new())),
            TargetSelector::Explicit(ids) => {
                let found = self.targets.find_targets(ids).await?;
                let missing: Vec<TargetId> = ids
                    .iter()
                    .filter(|id| !found.iter().any(|t| &t.id == *id))
                    .cloned()
                    .collect();
                for id in &missing {
                    warn!(target_id = %id, "Unknown target, skipping");
                }
                Ok((found, missing))
            }
        }
    }
}
