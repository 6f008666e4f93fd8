// Job Store Port (Interface)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Batch, BatchId, ErrorDetail, Job, JobStatus};
use crate::error::Result;

/// Filter for administrative job listings
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub batch_id: Option<BatchId>,
    pub limit: Option<u32>,
}

/// Job counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Persistence for jobs and batches.
///
/// Every write is idempotent under retry. Job rows have a single writer (the
/// dispatcher handling the job); the batch row is shared by all of its jobs and
/// is only ever written through `swap_batch`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job (a retried insert of the same id is a no-op)
    async fn create_job(&self, job: &Job) -> Result<()>;

    /// Insert a batch (a retried insert of the same id is a no-op)
    async fn create_batch(&self, batch: &Batch) -> Result<()>;

    /// Set status `in-progress`, record the start time, bump attempts
    async fn set_job_running(&self, job_id: &str, started_at: i64) -> Result<()>;

    async fn complete_job(&self, job_id: &str, result_refs: &[String], duration_ms: i64)
        -> Result<()>;

    async fn fail_job(&self, job_id: &str, detail: &ErrorDetail, duration_ms: i64) -> Result<()>;

    async fn find_job(&self, job_id: &str) -> Result<Option<Job>>;

    async fn find_batch(&self, batch_id: &str) -> Result<Option<Batch>>;

    /// Compare-and-swap the batch aggregate.
    ///
    /// Persists sets, status and duration only if the stored version still equals
    /// `expected_version`, bumping it by one. Returns false on a lost race.
    async fn swap_batch(&self, batch: &Batch, expected_version: i64) -> Result<bool>;

    async fn find_jobs_by_batch(&self, batch_id: &str) -> Result<Vec<Job>>;

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Most recent batches first
    async fn list_batches(&self, limit: u32) -> Result<Vec<Batch>>;

    /// Batches not yet terminal
    async fn find_open_batches(&self) -> Result<Vec<Batch>>;

    async fn count_jobs_by_status(&self) -> Result<StatusCounts>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::{Rule, RuleId, ScheduledRequest, Target, TargetId};
    use crate::error::AppError;
    use crate::port::{RuleCatalog, ScheduleStore, TargetCatalog};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        jobs: BTreeMap<String, Job>,
        batches: BTreeMap<String, Batch>,
        schedules: BTreeMap<String, ScheduledRequest>,
        targets: BTreeMap<TargetId, Target>,
        rules: BTreeMap<RuleId, Rule>,
    }

    /// In-memory store implementing every persistence port.
    ///
    /// `swap_batch` is a real compare-and-swap, and `find_batch` yields to the
    /// scheduler so concurrent aggregations interleave.
    #[derive(Default)]
    pub struct InMemoryStore {
        state: Mutex<State>,
        lost_swaps: AtomicUsize,
        swap_attempts: AtomicUsize,
        fail_terminal_writes: AtomicBool,
    }

    impl InMemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next `n` swaps report a lost race
        pub fn lose_next_swaps(&self, n: usize) {
            self.lost_swaps.store(n, Ordering::SeqCst);
        }

        pub fn swap_attempts(&self) -> usize {
            self.swap_attempts.load(Ordering::SeqCst)
        }

        /// Make `complete_job`/`fail_job` return a database error
        pub fn fail_terminal_writes(&self, fail: bool) {
            self.fail_terminal_writes.store(fail, Ordering::SeqCst);
        }

        pub fn job_count(&self) -> usize {
            self.state.lock().unwrap().jobs.len()
        }

        pub fn batch_count(&self) -> usize {
            self.state.lock().unwrap().batches.len()
        }

        fn terminal_write_guard(&self) -> Result<()> {
            if self.fail_terminal_writes.load(Ordering::SeqCst) {
                return Err(AppError::Database("injected write failure".to_string()));
            }
            Ok(())
        }

        fn with_job<F>(&self, job_id: &str, f: F) -> Result<()>
        where
            F: FnOnce(&mut Job),
        {
            let mut state = self.state.lock().unwrap();
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))?;
            f(job);
            Ok(())
        }
    }

    #[async_trait]
    impl JobStore for InMemoryStore {
        async fn create_job(&self, job: &Job) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.jobs.entry(job.id.clone()).or_insert_with(|| job.clone());
            Ok(())
        }

        async fn create_batch(&self, batch: &Batch) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state
                .batches
                .entry(batch.id.clone())
                .or_insert_with(|| batch.clone());
            Ok(())
        }

        async fn set_job_running(&self, job_id: &str, started_at: i64) -> Result<()> {
            self.with_job(job_id, |job| {
                job.status = JobStatus::InProgress;
                job.started_at = Some(started_at);
                job.attempts += 1;
            })
        }

        async fn complete_job(
            &self,
            job_id: &str,
            result_refs: &[String],
            duration_ms: i64,
        ) -> Result<()> {
            self.terminal_write_guard()?;
            self.with_job(job_id, |job| {
                job.status = JobStatus::Completed;
                job.result_refs = result_refs.to_vec();
                job.duration_ms = Some(duration_ms);
            })
        }

        async fn fail_job(&self, job_id: &str, detail: &ErrorDetail, duration_ms: i64) -> Result<()> {
            self.terminal_write_guard()?;
            self.with_job(job_id, |job| {
                job.status = JobStatus::Failed;
                job.error = Some(detail.clone());
                job.duration_ms = Some(duration_ms);
            })
        }

        async fn find_job(&self, job_id: &str) -> Result<Option<Job>> {
            Ok(self.state.lock().unwrap().jobs.get(job_id).cloned())
        }

        async fn find_batch(&self, batch_id: &str) -> Result<Option<Batch>> {
            let batch = self.state.lock().unwrap().batches.get(batch_id).cloned();
            tokio::task::yield_now().await;
            Ok(batch)
        }

        async fn swap_batch(&self, batch: &Batch, expected_version: i64) -> Result<bool> {
            self.swap_attempts.fetch_add(1, Ordering::SeqCst);
            if self
                .lost_swaps
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Ok(false);
            }

            let mut state = self.state.lock().unwrap();
            let stored = state
                .batches
                .get_mut(&batch.id)
                .ok_or_else(|| AppError::NotFound(format!("batch {}", batch.id)))?;
            if stored.version != expected_version {
                return Ok(false);
            }
            let mut next = batch.clone();
            next.version = expected_version + 1;
            *stored = next;
            Ok(true)
        }

        async fn find_jobs_by_batch(&self, batch_id: &str) -> Result<Vec<Job>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .jobs
                .values()
                .filter(|j| j.batch_id.as_deref() == Some(batch_id))
                .cloned()
                .collect())
        }

        async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
            let state = self.state.lock().unwrap();
            let limit = filter.limit.unwrap_or(u32::MAX) as usize;
            Ok(state
                .jobs
                .values()
                .filter(|j| filter.status.map_or(true, |s| j.status == s))
                .filter(|j| {
                    filter
                        .batch_id
                        .as_ref()
                        .map_or(true, |b| j.batch_id.as_ref() == Some(b))
                })
                .take(limit)
                .cloned()
                .collect())
        }

        async fn list_batches(&self, limit: u32) -> Result<Vec<Batch>> {
            let state = self.state.lock().unwrap();
            let mut batches: Vec<Batch> = state.batches.values().cloned().collect();
            batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            batches.truncate(limit as usize);
            Ok(batches)
        }

        async fn find_open_batches(&self) -> Result<Vec<Batch>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .batches
                .values()
                .filter(|b| !b.is_terminal())
                .cloned()
                .collect())
        }

        async fn count_jobs_by_status(&self) -> Result<StatusCounts> {
            let state = self.state.lock().unwrap();
            let mut counts = StatusCounts::default();
            for job in state.jobs.values() {
                match job.status {
                    JobStatus::Pending => counts.pending += 1,
                    JobStatus::InProgress => counts.in_progress += 1,
                    JobStatus::Completed => counts.completed += 1,
                    JobStatus::Failed => counts.failed += 1,
                }
            }
            Ok(counts)
        }
    }

    #[async_trait]
    impl ScheduleStore for InMemoryStore {
        async fn create_schedule(&self, request: &ScheduledRequest) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.schedules.insert(request.id.clone(), request.clone());
            Ok(())
        }

        async fn list_schedules(&self) -> Result<Vec<ScheduledRequest>> {
            Ok(self.state.lock().unwrap().schedules.values().cloned().collect())
        }

        async fn due_schedules(&self, today: NaiveDate) -> Result<Vec<ScheduledRequest>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .schedules
                .values()
                .filter(|s| s.is_due(today))
                .cloned()
                .collect())
        }

        async fn delete_schedule(&self, id: &str) -> Result<bool> {
            Ok(self.state.lock().unwrap().schedules.remove(id).is_some())
        }
    }

    #[async_trait]
    impl TargetCatalog for InMemoryStore {
        async fn find_targets(&self, ids: &[TargetId]) -> Result<Vec<Target>> {
            let state = self.state.lock().unwrap();
            Ok(ids
                .iter()
                .filter_map(|id| state.targets.get(id).cloned())
                .collect())
        }

        async fn all_targets(&self) -> Result<Vec<Target>> {
            Ok(self.state.lock().unwrap().targets.values().cloned().collect())
        }

        async fn upsert_target(&self, target: &Target) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.targets.insert(target.id.clone(), target.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl RuleCatalog for InMemoryStore {
        async fn find_rules(&self, ids: &[RuleId]) -> Result<Vec<Rule>> {
            let state = self.state.lock().unwrap();
            Ok(ids
                .iter()
                .filter_map(|id| state.rules.get(id).cloned())
                .collect())
        }

        async fn all_rules(&self) -> Result<Vec<Rule>> {
            Ok(self.state.lock().unwrap().rules.values().cloned().collect())
        }

        async fn upsert_rule(&self, rule: &Rule) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.rules.insert(rule.id.clone(), rule.clone());
            Ok(())
        }
    }
}
