// Dispatcher - bounded-concurrency consumer driving each job through its lifecycle

pub mod constants;
mod latch;
mod panic_guard;
mod shutdown;

use constants::*;
pub use latch::TerminalLatch;
pub use panic_guard::describe_join_error;
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::aggregator::BatchAggregator;
use crate::application::executor::{ExecutorAdapter, ScanOutcome};
use crate::application::retry::{retry_transient, Backoff, JobRetryPolicy, RetryDecision};
use crate::domain::{ErrorDetail, Job, JobMessage, JobStatus, Rule, RuleSelection};
use crate::error::{AppError, Result};
use crate::port::{
    Delivery, DeliveryTag, JobStore, Notification, Notifier, QueueTransport, RuleCatalog,
    RuleStager, StagedRules, SystemProbe, TimeProvider,
};

/// What to do when the queue is empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Exit once the queue is drained (short-lived worker)
    Drain,
    /// Keep polling (long-lived worker)
    Poll,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent_scans: usize,
    pub mode: RunMode,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub retry: JobRetryPolicy,
    pub memory_threshold_percent: f32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_scans: DEFAULT_MAX_CONCURRENT_SCANS,
            mode: RunMode::Poll,
            poll_interval: IDLE_POLL_INTERVAL,
            shutdown_grace: MAX_SHUTDOWN_GRACE,
            retry: JobRetryPolicy::default(),
            memory_threshold_percent: MEMORY_ADMISSION_THRESHOLD,
        }
    }
}

/// Final state of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    AckedSuccess,
    AckedFailure,
    /// Undecodable body or unknown job; dropped without touching any state
    AckedMalformed,
    NackedForRequeue,
}

/// Counters returned when the dispatcher stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub malformed: u64,
    pub requeued: u64,
    /// Tasks killed after the shutdown grace period
    pub abandoned: u64,
}

impl DispatchSummary {
    fn record(&mut self, result: std::result::Result<Disposition, JoinError>) {
        match result {
            Ok(Disposition::AckedSuccess) => self.succeeded += 1,
            Ok(Disposition::AckedFailure) => self.failed += 1,
            Ok(Disposition::AckedMalformed) => self.malformed += 1,
            Ok(Disposition::NackedForRequeue) => self.requeued += 1,
            Err(e) => {
                if e.is_panic() {
                    error!(error = %describe_join_error(e), "Delivery task crashed");
                }
                self.abandoned += 1;
            }
        }
    }
}

/// Collaborators of the dispatcher
pub struct DispatcherDeps {
    pub transport: Arc<dyn QueueTransport>,
    pub store: Arc<dyn JobStore>,
    pub rules: Arc<dyn RuleCatalog>,
    pub stager: Arc<dyn RuleStager>,
    pub adapter: Arc<ExecutorAdapter>,
    pub aggregator: Arc<BatchAggregator>,
    pub notifier: Arc<dyn Notifier>,
    pub time_provider: Arc<dyn TimeProvider>,
    /// Enables memory-based admission control when present
    pub probe: Option<Arc<dyn SystemProbe>>,
}

/// Worker Dispatcher
///
/// Pulls job messages, admits at most `max_concurrent_scans` at a time, and
/// settles every delivery: acknowledged once a terminal outcome is durably
/// recorded (success or failure alike), requeued when it is not.
pub struct Dispatcher {
    ctx: Arc<DispatchContext>,
    permits: Arc<Semaphore>,
    config: DispatcherConfig,
}

struct DispatchContext {
    deps: DispatcherDeps,
    retry: JobRetryPolicy,
}

impl Dispatcher {
    pub fn new(deps: DispatcherDeps, config: DispatcherConfig) -> Self {
        let size = config.max_concurrent_scans.max(1);
        Self {
            ctx: Arc::new(DispatchContext {
                deps,
                retry: config.retry.clone(),
            }),
            permits: Arc::new(Semaphore::new(size)),
            config,
        }
    }

    /// Run until the queue is drained (drain mode), shutdown is requested, or
    /// the transport fails for good.
    ///
    /// In-flight scans are waited for up to the shutdown grace period; past
    /// it they are abandoned and their messages returned to the queue.
    pub async fn run(&self, mut shutdown: ShutdownToken) -> Result<DispatchSummary> {
        info!(
            max_concurrent = self.config.max_concurrent_scans,
            mode = ?self.config.mode,
            "Dispatcher started"
        );

        let abort = CancellationToken::new();
        let mut tasks: JoinSet<Disposition> = JoinSet::new();
        let mut summary = DispatchSummary::default();
        let mut fatal = None;

        loop {
            if shutdown.is_shutdown() {
                info!("Shutdown requested, no longer admitting messages");
                break;
            }
            while let Some(done) = tasks.try_join_next() {
                summary.record(done);
            }
            if !self.wait_for_memory(&mut shutdown).await {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.wait() => break,
            };

            let delivery = match self.ctx.deps.transport.receive().await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    drop(permit);
                    if self.config.mode == RunMode::Drain {
                        info!("Queue empty, finishing in-flight scans");
                        break;
                    }
                    tokio::select! {
                        _ = sleep(self.config.poll_interval) => continue,
                        _ = shutdown.wait() => break,
                    }
                }
                Err(e) => {
                    error!(error = %e, "Queue transport failed");
                    fatal = Some(e);
                    break;
                }
            };

            summary.received += 1;
            let ctx = Arc::clone(&self.ctx);
            let abort = abort.clone();
            tasks.spawn(async move {
                let _permit = permit;
                ctx.handle_delivery(delivery, abort).await
            });
        }

        self.drain(&mut tasks, &mut summary, &abort, &mut shutdown)
            .await;

        info!(
            received = summary.received,
            succeeded = summary.succeeded,
            failed = summary.failed,
            malformed = summary.malformed,
            requeued = summary.requeued,
            abandoned = summary.abandoned,
            "Dispatcher stopped"
        );

        match fatal {
            Some(e) => Err(AppError::Transport(e)),
            None => Ok(summary),
        }
    }

    async fn drain(
        &self,
        tasks: &mut JoinSet<Disposition>,
        summary: &mut DispatchSummary,
        abort: &CancellationToken,
        shutdown: &mut ShutdownToken,
    ) {
        if !shutdown.is_shutdown() {
            loop {
                tokio::select! {
                    next = tasks.join_next() => match next {
                        Some(done) => summary.record(done),
                        None => return,
                    },
                    _ = shutdown.wait() => break,
                }
            }
        }

        if tasks.is_empty() {
            return;
        }
        let grace = self.config.shutdown_grace.min(MAX_SHUTDOWN_GRACE);
        info!(
            in_flight = tasks.len(),
            grace_secs = grace.as_secs(),
            "Waiting for in-flight scans"
        );
        let deadline = sleep(grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                next = tasks.join_next() => match next {
                    Some(done) => summary.record(done),
                    None => return,
                },
                _ = &mut deadline => break,
            }
        }

        warn!(in_flight = tasks.len(), "Grace period expired, interrupting in-flight scans");
        abort.cancel();
        let settle = async {
            while let Some(done) = tasks.join_next().await {
                summary.record(done);
            }
        };
        if tokio::time::timeout(EXECUTOR_TERMINATION_GRACE, settle).await.is_err() {
            tasks.abort_all();
            while let Some(done) = tasks.join_next().await {
                summary.record(done);
            }
        }
    }

    /// False if shutdown arrived while waiting
    async fn wait_for_memory(&self, shutdown: &mut ShutdownToken) -> bool {
        let Some(probe) = &self.ctx.deps.probe else {
            return true;
        };
        loop {
            let metrics = probe.get_metrics().await;
            let used = metrics.memory_percent();
            if used < self.config.memory_threshold_percent {
                return true;
            }
            warn!(
                memory_percent = %used,
                threshold = %self.config.memory_threshold_percent,
                "Memory pressure, holding back admission"
            );
            tokio::select! {
                _ = sleep(MEMORY_BACKOFF) => {}
                _ = shutdown.wait() => return false,
            }
        }
    }
}

impl DispatchContext {
    /// received -> running -> {acked-success | acked-failure | nacked-for-requeue}
    async fn handle_delivery(self: Arc<Self>, delivery: Delivery, abort: CancellationToken) -> Disposition {
        let message = match JobMessage::decode(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(delivery = %delivery.tag, error = %e, "Dropping malformed job message");
                self.ack(&delivery.tag).await;
                return Disposition::AckedMalformed;
            }
        };

        let job = match self.deps.store.find_job(&message.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %message.job_id, "Message references unknown job, dropping");
                self.ack(&delivery.tag).await;
                return Disposition::AckedMalformed;
            }
            Err(e) => {
                error!(job_id = %message.job_id, error = %e, "Failed to load job, requeueing");
                self.requeue(&delivery.tag).await;
                return Disposition::NackedForRequeue;
            }
        };

        if job.status.is_terminal() {
            // Outcome was recorded but the ack never landed
            info!(job_id = %job.id, status = %job.status, "Job already terminal, settling redelivery");
            let success = job.status == JobStatus::Completed;
            self.report_batch(&job, success).await;
            self.ack(&delivery.tag).await;
            return if success {
                Disposition::AckedSuccess
            } else {
                Disposition::AckedFailure
            };
        }

        let latch = TerminalLatch::new();
        let settled = CancellationToken::new();
        let listener = self.spawn_interrupt_listener(
            delivery.tag.clone(),
            latch.clone(),
            abort.clone(),
            settled.clone(),
        );
        let disposition = self.run_job(job, &message, &delivery.tag, &latch, &abort).await;
        settled.cancel();
        if let Err(e) = listener.await {
            error!(
                delivery = %delivery.tag,
                error = %describe_join_error(e),
                "Interrupt listener did not finish"
            );
        }
        disposition
    }

    /// Requeue the delivery if shutdown interrupts the job before it settles
    fn spawn_interrupt_listener(
        self: &Arc<Self>,
        tag: DeliveryTag,
        latch: TerminalLatch,
        abort: CancellationToken,
        settled: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = settled.cancelled() => {}
                _ = abort.cancelled() => {
                    if latch.claim() {
                        warn!(delivery = %tag, "Job interrupted by shutdown, returning message to queue");
                        ctx.requeue(&tag).await;
                    }
                }
            }
        })
    }

    async fn run_job(
        &self,
        mut job: Job,
        message: &JobMessage,
        tag: &DeliveryTag,
        latch: &TerminalLatch,
        abort: &CancellationToken,
    ) -> Disposition {
        let staged = self.stage(&job, &message.rule_selection()).await;

        let started_at = self.deps.time_provider.now_millis();
        let running = match job.start(started_at) {
            Ok(()) => {
                let store = &self.deps.store;
                let job_id = job.id.as_str();
                retry_transient("set_job_running", STORE_WRITE_ATTEMPTS, store_backoff(), || {
                    store.set_job_running(job_id, started_at)
                })
                .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = running {
            error!(job_id = %job.id, error = %e, "Failed to mark job running, requeueing");
            if let Ok(staged) = staged {
                self.release(staged).await;
            }
            if latch.claim() {
                self.requeue(tag).await;
            }
            return Disposition::NackedForRequeue;
        }
        info!(
            job_id = %job.id,
            batch_id = ?job.batch_id,
            target = %job.target.host,
            attempt = job.attempts,
            "Scan started"
        );

        let clock = Instant::now();
        let outcome = match staged {
            Ok(staged) => {
                let outcome = self.execute_isolated(&job, &staged, abort, clock).await;
                self.release(staged).await;
                outcome
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to stage rules");
                ScanOutcome::Failed(ErrorDetail::new(
                    "Failed to load rules",
                    e.to_string(),
                    self.deps.time_provider.now_millis(),
                    clock.elapsed().as_millis() as i64,
                ))
            }
        };

        self.conclude(job, outcome, tag, latch, abort).await
    }

    async fn stage(&self, job: &Job, selection: &RuleSelection) -> Result<StagedRules> {
        let rules: Vec<Rule> = match selection {
            RuleSelection::All => self.deps.rules.all_rules().await?,
            RuleSelection::Explicit(ids) => {
                let found = self.deps.rules.find_rules(ids).await?;
                let missing: Vec<&String> = ids
                    .iter()
                    .filter(|id| !found.iter().any(|r| &r.id == *id))
                    .collect();
                if !missing.is_empty() {
                    return Err(AppError::NotFound(format!("rules {:?}", missing)));
                }
                found
            }
        };
        if rules.is_empty() {
            return Err(AppError::Validation("no rules available".to_string()));
        }
        self.deps.stager.stage(&job.id, &rules).await
    }

    /// Execution runs in its own task so a panicking executor fails the job instead of the dispatcher
    async fn execute_isolated(
        &self,
        job: &Job,
        staged: &StagedRules,
        abort: &CancellationToken,
        clock: Instant,
    ) -> ScanOutcome {
        let adapter = Arc::clone(&self.deps.adapter);
        let job_for_exec = job.clone();
        let staged_for_exec = staged.clone();
        let abort = abort.clone();

        let handle = tokio::spawn(async move {
            adapter
                .execute(&job_for_exec, &staged_for_exec, &abort)
                .await
        });

        match handle.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                let message = describe_join_error(join_err);
                error!(job_id = %job.id, error = %message, "Scan task crashed");
                ScanOutcome::Failed(ErrorDetail::new(
                    "Scan executor crashed",
                    message,
                    self.deps.time_provider.now_millis(),
                    clock.elapsed().as_millis() as i64,
                ))
            }
        }
    }

    async fn conclude(
        &self,
        mut job: Job,
        outcome: ScanOutcome,
        tag: &DeliveryTag,
        latch: &TerminalLatch,
        abort: &CancellationToken,
    ) -> Disposition {
        if !latch.claim() {
            debug!(job_id = %job.id, "Delivery already returned to queue by shutdown");
            return Disposition::NackedForRequeue;
        }

        let (result_refs, duration_ms, detail) = match outcome {
            ScanOutcome::Completed {
                result_refs,
                duration_ms,
                ..
            } => (result_refs, duration_ms, None),
            ScanOutcome::Failed(detail) if !abort.is_cancelled() => {
                (Vec::new(), detail.duration_ms, Some(detail))
            }
            // A failure while shutting down is not trusted as the job's outcome
            ScanOutcome::Failed(_) | ScanOutcome::Interrupted => {
                warn!(job_id = %job.id, "Job cut short by shutdown, returning message to queue");
                self.requeue(tag).await;
                return Disposition::NackedForRequeue;
            }
        };

        if detail.is_some() {
            if let RetryDecision::Retry(delay_ms) = self.retry.should_retry(&job.id, job.attempts) {
                tokio::select! {
                    _ = sleep(Duration::from_millis(delay_ms.max(0) as u64)) => {}
                    _ = abort.cancelled() => {}
                }
                self.requeue(tag).await;
                return Disposition::NackedForRequeue;
            }
        }

        let success = match self.record_terminal(&mut job, result_refs, duration_ms, detail).await {
            Ok(success) => success,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Job outcome could not be recorded, requeueing");
                self.requeue(tag).await;
                return Disposition::NackedForRequeue;
            }
        };

        if !success {
            if let Some(detail) = &job.error {
                self.deps
                    .notifier
                    .notify(&Notification::JobFailed {
                        job_id: job.id.clone(),
                        batch_id: job.batch_id.clone(),
                        target: job.target.host.clone(),
                        message: detail.describe(),
                    })
                    .await;
            }
        }

        self.report_batch(&job, success).await;
        self.ack(tag).await;

        if success {
            Disposition::AckedSuccess
        } else {
            Disposition::AckedFailure
        }
    }

    /// Persist the terminal state; returns whether the job ended up completed.
    ///
    /// If a completion cannot be written, the write failure itself is recorded
    /// as the job's failure.
    async fn record_terminal(
        &self,
        job: &mut Job,
        result_refs: Vec<String>,
        duration_ms: i64,
        detail: Option<ErrorDetail>,
    ) -> Result<bool> {
        let store = &self.deps.store;
        let job_id = job.id.clone();

        let detail = match detail {
            None => {
                let written = retry_transient("complete_job", STORE_WRITE_ATTEMPTS, store_backoff(), || {
                    store.complete_job(&job_id, &result_refs, duration_ms)
                })
                .await;
                match written {
                    Ok(()) => {
                        job.complete(result_refs, duration_ms)?;
                        info!(job_id = %job_id, duration_ms = duration_ms, "Job completed");
                        return Ok(true);
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Failed to record completion, recording failure instead");
                        ErrorDetail::new(
                            "Failed to record scan result",
                            e.to_string(),
                            self.deps.time_provider.now_millis(),
                            duration_ms,
                        )
                    }
                }
            }
            Some(detail) => detail,
        };

        retry_transient("fail_job", STORE_WRITE_ATTEMPTS, store_backoff(), || {
            store.fail_job(&job_id, &detail, duration_ms)
        })
        .await?;
        warn!(job_id = %job_id, error = %detail.describe(), duration_ms = duration_ms, "Job failed");
        job.fail(detail, duration_ms)?;
        Ok(false)
    }

    async fn report_batch(&self, job: &Job, success: bool) {
        let Some(batch_id) = &job.batch_id else {
            return;
        };
        if let Err(e) = self.deps.aggregator.record_outcome(batch_id, &job.id, success).await {
            error!(
                batch_id = %batch_id,
                job_id = %job.id,
                error = %e,
                "Failed to record batch outcome, batch left for reconciliation"
            );
        }
    }

    async fn release(&self, staged: StagedRules) {
        let job_id = staged.job_id.clone();
        if let Err(e) = self.deps.stager.release(staged).await {
            warn!(job_id = %job_id, error = %e, "Failed to clean up staged rules");
        }
    }

    async fn ack(&self, tag: &DeliveryTag) {
        if let Err(e) = self.deps.transport.acknowledge(tag).await {
            warn!(delivery = %tag, error = %e, "Acknowledge failed, message may be redelivered");
        }
    }

    async fn requeue(&self, tag: &DeliveryTag) {
        if let Err(e) = self.deps.transport.requeue(tag).await {
            warn!(delivery = %tag, error = %e, "Requeue failed, message will be redelivered by the broker");
        }
    }
}

fn store_backoff() -> Backoff {
    Backoff::Exponential(STORE_RETRY_BASE_DELAY)
}

#[cfg(test)]
mod tests;
