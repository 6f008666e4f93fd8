// SQLite JobStore Implementation

use std::collections::BTreeSet;

use async_trait::async_trait;
use scanfleet_core::domain::{
    Batch, BatchStatus, DomainError, ErrorDetail, Job, JobStatus, RuleSelection, Target,
};
use scanfleet_core::error::{AppError, Result};
use scanfleet_core::port::{JobFilter, JobStore, StatusCounts};
use sqlx::SqlitePool;

use crate::sql_error::map_sqlx_error;

/// Jobs, batches, schedules and catalogs in one SQLite database
pub struct SqliteScanStore {
    pub(crate) pool: SqlitePool,
}

impl SqliteScanStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Explain why a guarded update touched no row
    async fn rejected_transition(&self, job_id: &str, to: JobStatus) -> AppError {
        let current: std::result::Result<Option<String>, AppError> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error);
        match current {
            Ok(None) => AppError::NotFound(format!("job {}", job_id)),
            Ok(Some(from)) => AppError::Domain(DomainError::InvalidStateTransition {
                from,
                to: to.to_string(),
            }),
            Err(e) => e,
        }
    }

    /// Terminal writes succeed again when the job already holds that status
    async fn terminal_write_result(&self, job_id: &str, to: JobStatus, rows: u64) -> Result<()> {
        if rows > 0 {
            return Ok(());
        }
        match self.rejected_transition(job_id, to).await {
            AppError::Domain(DomainError::InvalidStateTransition { from, .. }) if from == to.as_str() => Ok(()),
            e => Err(e),
        }
    }
}

#[async_trait]
impl JobStore for SqliteScanStore {
    async fn create_job(&self, job: &Job) -> Result<()> {
        let error_detail = job.error.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO jobs (
                id, batch_id, target_id, target_host, rule_ids, scan_all,
                status, error_detail, result_refs,
                scheduled_at, started_at, duration_ms, attempts
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.batch_id)
        .bind(&job.target.id)
        .bind(&job.target.host)
        .bind(serde_json::to_string(job.rules.rule_ids())?)
        .bind(job.rules.is_all())
        .bind(job.status.as_str())
        .bind(error_detail)
        .bind(serde_json::to_string(&job.result_refs)?)
        .bind(job.scheduled_at)
        .bind(job.started_at)
        .bind(job.duration_ms)
        .bind(job.attempts)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn create_batch(&self, batch: &Batch) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO batches (
                id, name, total, completed_ids, failed_ids,
                status, created_at, duration_ms, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&batch.id)
        .bind(&batch.name)
        .bind(batch.total)
        .bind(serde_json::to_string(&batch.completed)?)
        .bind(serde_json::to_string(&batch.failed)?)
        .bind(batch.status.as_str())
        .bind(batch.created_at)
        .bind(batch.duration_ms)
        .bind(batch.version)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn set_job_running(&self, job_id: &str, started_at: i64) -> Result<()> {
        // Re-running an in-progress job (redelivery) is allowed and resets the timer
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'in-progress', started_at = ?, attempts = attempts + 1
            WHERE id = ? AND status IN ('pending', 'in-progress')
            "#,
        )
        .bind(started_at)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_transition(job_id, JobStatus::InProgress).await);
        }
        Ok(())
    }

    async fn complete_job(&self, job_id: &str, result_refs: &[String], duration_ms: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', result_refs = ?, duration_ms = ?
            WHERE id = ? AND status = 'in-progress'
            "#,
        )
        .bind(serde_json::to_string(result_refs)?)
        .bind(duration_ms)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        self.terminal_write_result(job_id, JobStatus::Completed, result.rows_affected())
            .await
    }

    async fn fail_job(&self, job_id: &str, detail: &ErrorDetail, duration_ms: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', error_detail = ?, duration_ms = ?
            WHERE id = ? AND status = 'in-progress'
            "#,
        )
        .bind(serde_json::to_string(detail)?)
        .bind(duration_ms)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        self.terminal_write_result(job_id, JobStatus::Failed, result.rows_affected())
            .await
    }

    async fn find_job(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn find_batch(&self, batch_id: &str) -> Result<Option<Batch>> {
        let row = sqlx::query_as::<_, BatchRow>("SELECT * FROM batches WHERE id = ?")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(BatchRow::into_batch).transpose()
    }

    async fn swap_batch(&self, batch: &Batch, expected_version: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET completed_ids = ?, failed_ids = ?, status = ?, duration_ms = ?,
                version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(serde_json::to_string(&batch.completed)?)
        .bind(serde_json::to_string(&batch.failed)?)
        .bind(batch.status.as_str())
        .bind(batch.duration_ms)
        .bind(&batch.id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT version FROM batches WHERE id = ?")
            .bind(&batch.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(AppError::NotFound(format!("batch {}", batch.id))),
        }
    }

    async fn find_jobs_by_batch(&self, batch_id: &str) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT * FROM jobs
            WHERE batch_id = ?
            ORDER BY scheduled_at ASC, id ASC
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT * FROM jobs
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR batch_id = ?2)
            ORDER BY scheduled_at DESC, id ASC
            LIMIT ?3
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.batch_id)
        .bind(filter.limit.map(i64::from).unwrap_or(-1))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn list_batches(&self, limit: u32) -> Result<Vec<Batch>> {
        let rows: Vec<BatchRow> =
            sqlx::query_as("SELECT * FROM batches ORDER BY created_at DESC, id ASC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        rows.into_iter().map(BatchRow::into_batch).collect()
    }

    async fn find_open_batches(&self) -> Result<Vec<Batch>> {
        let rows: Vec<BatchRow> = sqlx::query_as(
            r#"
            SELECT * FROM batches
            WHERE status IN ('pending', 'in-progress')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(BatchRow::into_batch).collect()
    }

    async fn count_jobs_by_status(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match status.parse::<JobStatus>()? {
                JobStatus::Pending => counts.pending = count,
                JobStatus::InProgress => counts.in_progress = count,
                JobStatus::Completed => counts.completed = count,
                JobStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }
}

/// SQLite row representation of a job
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    batch_id: Option<String>,
    target_id: String,
    target_host: String,
    rule_ids: String,   // JSON array
    scan_all: bool,
    status: String,
    error_detail: Option<String>, // JSON object
    result_refs: String, // JSON array
    scheduled_at: i64,
    started_at: Option<i64>,
    duration_ms: Option<i64>,
    attempts: i32,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let rule_ids: Vec<String> = serde_json::from_str(&self.rule_ids)?;
        let rules = RuleSelection::from_parts(rule_ids, self.scan_all)?;
        let error = self
            .error_detail
            .as_deref()
            .map(serde_json::from_str::<ErrorDetail>)
            .transpose()?;

        Ok(Job {
            id: self.id,
            batch_id: self.batch_id,
            target: Target::new(self.target_id, self.target_host),
            rules,
            status: self.status.parse()?,
            error,
            result_refs: serde_json::from_str(&self.result_refs)?,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            duration_ms: self.duration_ms,
            attempts: self.attempts,
        })
    }
}

/// SQLite row representation of a batch
#[derive(Debug, sqlx::FromRow)]
struct BatchRow {
    id: String,
    name: String,
    total: i64,
    completed_ids: String, // JSON array
    failed_ids: String,    // JSON array
    status: String,
    created_at: i64,
    duration_ms: Option<i64>,
    version: i64,
}

impl BatchRow {
    fn into_batch(self) -> Result<Batch> {
        let completed: BTreeSet<String> = serde_json::from_str(&self.completed_ids)?;
        let failed: BTreeSet<String> = serde_json::from_str(&self.failed_ids)?;
        let status: BatchStatus = self.status.parse()?;

        Ok(Batch {
            id: self.id,
            name: self.name,
            total: self.total as u32,
            completed,
            failed,
            status,
            created_at: self.created_at,
            duration_ms: self.duration_ms,
            version: self.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use scanfleet_core::application::BatchAggregator;
    use scanfleet_core::port::notifier::mocks::RecordingNotifier;
    use scanfleet_core::port::time_provider::mocks::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    async fn setup_test_db() -> SqliteScanStore {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteScanStore::new(pool)
    }

    fn job(id: &str, batch_id: Option<&str>, rules: RuleSelection) -> Job {
        Job::new(
            id,
            batch_id.map(str::to_string),
            Target::new(format!("t-{}", id), format!("{}.example.com", id)),
            rules,
            1_000,
        )
    }

    #[tokio::test]
    async fn test_insert_and_find_job() {
        let store = setup_test_db().await;
        let original = job("a", None, RuleSelection::Explicit(vec!["cve-1".into(), "cve-2".into()]));

        store.create_job(&original).await.unwrap();
        // Insert is idempotent
        store.create_job(&original).await.unwrap();

        let found = store.find_job("a").await.unwrap().unwrap();
        assert_eq!(found, original);
        assert!(store.find_job("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let store = setup_test_db().await;
        store.create_job(&job("a", None, RuleSelection::All)).await.unwrap();

        store.set_job_running("a", 2_000).await.unwrap();
        store.set_job_running("a", 3_000).await.unwrap();
        let running = store.find_job("a").await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::InProgress);
        assert_eq!(running.started_at, Some(3_000));
        assert_eq!(running.attempts, 2);

        let refs = vec!["file:///results/a/1.json".to_string()];
        store.complete_job("a", &refs, 42).await.unwrap();
        // Retried write of the same outcome is accepted
        store.complete_job("a", &refs, 42).await.unwrap();

        let done = store.find_job("a").await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result_refs, refs);
        assert_eq!(done.duration_ms, Some(42));
    }

    #[tokio::test]
    async fn test_terminal_job_never_regresses() {
        let store = setup_test_db().await;
        store.create_job(&job("a", None, RuleSelection::All)).await.unwrap();
        store.set_job_running("a", 2_000).await.unwrap();
        let detail = ErrorDetail::new("Scan timed out", "deadline", 2_500, 500).timed_out();
        store.fail_job("a", &detail, 500).await.unwrap();

        assert!(matches!(
            store.complete_job("a", &[], 1).await.unwrap_err(),
            AppError::Domain(DomainError::InvalidStateTransition { .. })
        ));
        tokio_test::assert_err!(store.set_job_running("a", 9_000).await);

        let failed = store.find_job("a").await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error, Some(detail));
    }

    #[tokio::test]
    async fn test_unknown_job_updates() {
        let store = setup_test_db().await;
        assert!(matches!(
            store.set_job_running("ghost", 1).await.unwrap_err(),
            AppError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_swap_batch_compare_and_swap() {
        let store = setup_test_db().await;
        store
            .create_batch(&Batch::new("b-1", "nightly", 2, 1_000).unwrap())
            .await
            .unwrap();

        let mut batch = store.find_batch("b-1").await.unwrap().unwrap();
        batch.apply_outcome("a", true, 2_000);
        assert!(store.swap_batch(&batch, 0).await.unwrap());

        // Stale version loses
        let mut stale = batch.clone();
        stale.apply_outcome("b", false, 3_000);
        assert!(!store.swap_batch(&stale, 0).await.unwrap());

        let stored = store.find_batch("b-1").await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert!(stored.completed.contains("a"));
        assert!(stored.failed.is_empty());

        let mut missing = batch.clone();
        missing.id = "nope".into();
        assert!(matches!(
            store.swap_batch(&missing, 0).await.unwrap_err(),
            AppError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_list_and_count() {
        let store = setup_test_db().await;
        store
            .create_batch(&Batch::new("b-1", "nightly", 2, 1_000).unwrap())
            .await
            .unwrap();
        store.create_job(&job("a", Some("b-1"), RuleSelection::All)).await.unwrap();
        store.create_job(&job("b", Some("b-1"), RuleSelection::All)).await.unwrap();
        store.create_job(&job("c", None, RuleSelection::All)).await.unwrap();
        store.set_job_running("c", 2_000).await.unwrap();

        assert_eq!(store.find_jobs_by_batch("b-1").await.unwrap().len(), 2);

        let pending = store
            .list_jobs(&JobFilter {
                status: Some(JobStatus::Pending),
                ..JobFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);

        let limited = store
            .list_jobs(&JobFilter {
                limit: Some(1),
                ..JobFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        let counts = store.count_jobs_by_status().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.in_progress, 1);
        assert_eq!(store.find_open_batches().await.unwrap().len(), 1);
        assert_eq!(store.list_batches(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_job_requires_existing_batch() {
        let store = setup_test_db().await;
        let err = store
            .create_job(&job("a", Some("missing"), RuleSelection::All))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_aggregator_over_sqlite_concurrently() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store = Arc::new(SqliteScanStore::new(pool));
        let notifier = Arc::new(RecordingNotifier::new());
        store
            .create_batch(&Batch::new("b-1", "nightly", 12, 0).unwrap())
            .await
            .unwrap();
        let aggregator = Arc::new(
            BatchAggregator::new(store.clone(), notifier.clone(), Arc::new(ManualClock::new(500)))
                .with_retry(64, Duration::from_millis(1)),
        );

        let handles: Vec<_> = (0..12)
            .map(|i| {
                let aggregator = Arc::clone(&aggregator);
                tokio::spawn(async move {
                    aggregator
                        .record_outcome("b-1", &format!("job-{}", i), i % 4 != 0)
                        .await
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let batch = store.find_batch("b-1").await.unwrap().unwrap();
        assert_eq!(batch.completed.len(), 9);
        assert_eq!(batch.failed.len(), 3);
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.duration_ms, Some(500));
        assert_eq!(notifier.batch_finished_count(), 1);
    }
}
