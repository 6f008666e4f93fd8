// Executor Adapter
//
// Runs the external scan executor under a deadline, persists findings to the
// object store, and turns whatever happened into a `ScanOutcome`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::dispatcher::constants::{
    DEFAULT_SCAN_DEADLINE, EXECUTOR_TERMINATION_GRACE, FINDINGS_BUFFER,
};
use crate::domain::{ErrorDetail, Finding, Job};
use crate::port::{ObjectStore, ScanError, ScanExecutor, ScanRequest, StagedRules, TimeProvider};

/// Result of one execution attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Completed {
        result_refs: Vec<String>,
        findings: usize,
        duration_ms: i64,
    },
    Failed(ErrorDetail),
    /// Process shutdown cut the scan short; nothing should be recorded
    Interrupted,
}

impl ScanOutcome {
    pub fn duration_ms(&self) -> i64 {
        match self {
            ScanOutcome::Completed { duration_ms, .. } => *duration_ms,
            ScanOutcome::Failed(detail) => detail.duration_ms,
            ScanOutcome::Interrupted => 0,
        }
    }
}

enum Interruption {
    Deadline,
    Shutdown,
}

/// Strictly increasing millisecond stamps for object keys
#[derive(Default)]
struct MonotonicMillis {
    last: AtomicI64,
}

impl MonotonicMillis {
    fn next(&self, now: i64) -> i64 {
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

pub struct ExecutorAdapter {
    executor: Arc<dyn ScanExecutor>,
    object_store: Arc<dyn ObjectStore>,
    time_provider: Arc<dyn TimeProvider>,
    deadline: Duration,
    termination_grace: Duration,
    stamps: MonotonicMillis,
}

impl ExecutorAdapter {
    pub fn new(
        executor: Arc<dyn ScanExecutor>,
        object_store: Arc<dyn ObjectStore>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            executor,
            object_store,
            time_provider,
            deadline: DEFAULT_SCAN_DEADLINE,
            termination_grace: EXECUTOR_TERMINATION_GRACE,
            stamps: MonotonicMillis::default(),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Execute one scan.
    ///
    /// The deadline is measured from this call. When it passes, or `abort`
    /// fires, the executor's cancellation token is triggered and it gets
    /// `termination_grace` to stop before being dropped.
    pub async fn execute(&self, job: &Job, rules: &StagedRules, abort: &CancellationToken) -> ScanOutcome {
        let started = Instant::now();
        let request = ScanRequest {
            job_id: job.id.clone(),
            target: job.target.host.clone(),
            rule_paths: rules.paths.clone(),
            scan_all: job.rules.is_all(),
        };
        let rules_attempted = rules.paths.len() as u32;

        let scope = abort.child_token();
        let (tx, mut rx) = mpsc::channel(FINDINGS_BUFFER);
        let scan = self.executor.scan(&request, tx, scope.clone());
        tokio::pin!(scan);
        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);

        let mut findings: Vec<Finding> = Vec::new();
        let mut finished = loop {
            tokio::select! {
                biased;
                result = &mut scan => break Ok(result),
                Some(finding) = rx.recv() => findings.push(finding),
                _ = &mut deadline => break Err(Interruption::Deadline),
                _ = abort.cancelled() => break Err(Interruption::Shutdown),
            }
        };

        if finished.is_err() {
            scope.cancel();
            // Keep receiving so a scan blocked on a full channel can observe the cancellation
            let wind_down = async {
                loop {
                    tokio::select! {
                        biased;
                        _ = &mut scan => break,
                        Some(finding) = rx.recv() => findings.push(finding),
                    }
                }
            };
            if tokio::time::timeout(self.termination_grace, wind_down).await.is_err() {
                warn!(job_id = %job.id, "Executor ignored cancellation, dropping it");
            }
        }
        while let Ok(finding) = rx.try_recv() {
            findings.push(finding);
        }

        // Shutdown cancels the executor's scope too, so it may return first with its own error
        if abort.is_cancelled() && !matches!(finished, Ok(Ok(())) | Err(Interruption::Deadline)) {
            finished = Err(Interruption::Shutdown);
        }

        let elapsed_ms = started.elapsed().as_millis() as i64;
        let now = self.time_provider.now_millis();
        let collected = findings.len() as u32;

        match finished {
            Ok(Ok(())) => {
                let result_refs = self.store_findings(job, &findings).await;
                info!(
                    job_id = %job.id,
                    findings = findings.len(),
                    stored = result_refs.len(),
                    duration_ms = elapsed_ms,
                    "Scan finished"
                );
                ScanOutcome::Completed {
                    result_refs,
                    findings: findings.len(),
                    duration_ms: elapsed_ms,
                }
            }
            Ok(Err(e)) => {
                warn!(job_id = %job.id, error = %e, duration_ms = elapsed_ms, "Scan failed");
                ScanOutcome::Failed(
                    ErrorDetail::new(failure_context(&e), e.to_string(), now, elapsed_ms)
                        .with_counts(rules_attempted, collected),
                )
            }
            Err(Interruption::Deadline) => {
                warn!(
                    job_id = %job.id,
                    deadline_secs = self.deadline.as_secs(),
                    findings = collected,
                    "Scan deadline exceeded"
                );
                ScanOutcome::Failed(
                    ErrorDetail::new(
                        "Scan timed out",
                        format!("timeout: deadline of {}s exceeded", self.deadline.as_secs_f64()),
                        now,
                        elapsed_ms,
                    )
                    .with_counts(rules_attempted, collected)
                    .timed_out(),
                )
            }
            Err(Interruption::Shutdown) => {
                warn!(job_id = %job.id, "Scan interrupted by shutdown");
                ScanOutcome::Interrupted
            }
        }
    }

    /// Best effort: a finding that cannot be serialized or stored is logged and skipped
    async fn store_findings(&self, job: &Job, findings: &[Finding]) -> Vec<String> {
        let mut refs = Vec::with_capacity(findings.len());
        for finding in findings {
            let stamp = self.stamps.next(self.time_provider.now_millis());
            let key = result_key(&job.id, &finding.rule_id, &job.target.host, stamp);

            let bytes = match serde_json::to_vec(finding) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(job_id = %job.id, key = %key, error = %e, "Failed to serialize finding, skipping");
                    continue;
                }
            };
            match self.object_store.put(&key, bytes).await {
                Ok(locator) => refs.push(locator),
                Err(e) => {
                    warn!(job_id = %job.id, key = %key, error = %e, "Failed to store finding, skipping");
                }
            }
        }
        refs
    }
}

fn failure_context(err: &ScanError) -> &'static str {
    match err {
        ScanError::RuleLoad(_) => "Failed to load rules",
        ScanError::TargetUnreachable(_) => "Target unreachable",
        ScanError::Spawn(_) => "Failed to start scanner",
        ScanError::Failed(_) => "Scan failed",
        ScanError::Cancelled => "Scan cancelled",
    }
}

/// `{job_id}/{rule_id}_{target}_{stamp}.json`, with path-hostile characters replaced
pub fn result_key(job_id: &str, rule_id: &str, target: &str, stamp_ms: i64) -> String {
    format!(
        "{}/{}_{}_{}.json",
        sanitize(job_id),
        sanitize(rule_id),
        sanitize(target),
        stamp_ms
    )
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RuleSelection, Target};
    use crate::port::object_store::mocks::InMemoryObjectStore;
    use crate::port::scan_executor::mocks::{MockScanExecutor, ScanBehavior};
    use crate::port::time_provider::SystemTimeProvider;
    use std::path::PathBuf;

    fn job(host: &str) -> Job {
        Job::new(
            "job-1",
            Some("b-1".into()),
            Target::new("t-1", host),
            RuleSelection::Explicit(vec!["cve-1".into(), "cve-2".into()]),
            0,
        )
    }

    fn staged() -> StagedRules {
        StagedRules {
            job_id: "job-1".into(),
            root: PathBuf::from("/staging/job-1"),
            paths: vec![
                PathBuf::from("/staging/job-1/cve-1.yaml"),
                PathBuf::from("/staging/job-1/cve-2.yaml"),
            ],
        }
    }

    fn adapter(behavior: ScanBehavior, store: Arc<InMemoryObjectStore>) -> ExecutorAdapter {
        ExecutorAdapter::new(
            Arc::new(MockScanExecutor::new(behavior)),
            store,
            Arc::new(SystemTimeProvider),
        )
        .with_termination_grace(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_findings_persisted_under_job_scope() {
        let store = Arc::new(InMemoryObjectStore::new());
        let adapter = adapter(ScanBehavior::Findings(3), store.clone());

        let outcome = adapter
            .execute(&job("https://example.com:8443"), &staged(), &CancellationToken::new())
            .await;

        match outcome {
            ScanOutcome::Completed { result_refs, findings, .. } => {
                assert_eq!(findings, 3);
                assert_eq!(result_refs.len(), 3);
            }
            other => panic!("expected completion, got {:?}", other),
        }
        let keys = store.keys();
        assert_eq!(keys.len(), 3, "keys must not collide");
        assert!(keys.iter().all(|k| k.starts_with("job-1/cve-")));
        assert!(keys.iter().all(|k| k.contains("https___example.com_8443")));
    }

    #[tokio::test]
    async fn test_store_failures_are_skipped() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.fail_puts_containing("cve-2");
        let adapter = adapter(ScanBehavior::Findings(4), store.clone());

        let outcome = adapter
            .execute(&job("example.com"), &staged(), &CancellationToken::new())
            .await;

        match outcome {
            ScanOutcome::Completed { result_refs, findings, .. } => {
                assert_eq!(findings, 4);
                assert_eq!(result_refs.len(), 2);
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_executor_error_becomes_structured_failure() {
        let store = Arc::new(InMemoryObjectStore::new());
        let adapter = adapter(
            ScanBehavior::FailAfter(1, "connection refused".into()),
            store.clone(),
        );

        let outcome = adapter
            .execute(&job("example.com"), &staged(), &CancellationToken::new())
            .await;

        let ScanOutcome::Failed(detail) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(detail.context, "Target unreachable");
        assert!(detail.message.contains("connection refused"));
        assert_eq!(detail.rules_attempted, 2);
        assert_eq!(detail.findings_collected, 1);
        assert!(!detail.timed_out);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let store = Arc::new(InMemoryObjectStore::new());
        let adapter = adapter(ScanBehavior::HangAfter(2), store).with_deadline(Duration::from_millis(30));

        let outcome = adapter
            .execute(&job("example.com"), &staged(), &CancellationToken::new())
            .await;

        let ScanOutcome::Failed(detail) = outcome else {
            panic!("expected failure");
        };
        assert!(detail.timed_out);
        assert!(detail.message.contains("timeout"));
        assert_eq!(detail.findings_collected, 2);
        assert!(detail.duration_ms >= 30);
    }

    #[tokio::test]
    async fn test_stalled_executor_dropped_after_grace() {
        let store = Arc::new(InMemoryObjectStore::new());
        let adapter = adapter(ScanBehavior::Stall, store).with_deadline(Duration::from_millis(20));

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            adapter.execute(&job("example.com"), &staged(), &CancellationToken::new()),
        )
        .await
        .expect("adapter must return after deadline + grace");

        assert!(matches!(outcome, ScanOutcome::Failed(ref d) if d.timed_out));
    }

    #[tokio::test]
    async fn test_abort_interrupts() {
        let store = Arc::new(InMemoryObjectStore::new());
        let adapter = adapter(ScanBehavior::HangAfter(0), store);
        let abort = CancellationToken::new();

        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = adapter.execute(&job("example.com"), &staged(), &abort).await;
        assert_eq!(outcome, ScanOutcome::Interrupted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancelled_scan_during_shutdown_is_never_a_failure() {
        for _ in 0..30 {
            let store = Arc::new(InMemoryObjectStore::new());
            let adapter = adapter(ScanBehavior::HangAfter(1), store.clone());
            let abort = CancellationToken::new();

            let trigger = abort.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                trigger.cancel();
            });

            let outcome = adapter.execute(&job("example.com"), &staged(), &abort).await;
            assert_eq!(outcome, ScanOutcome::Interrupted);
            assert!(store.keys().is_empty());
        }
    }

    #[tokio::test]
    async fn test_findings_beyond_channel_capacity_are_all_kept() {
        let store = Arc::new(InMemoryObjectStore::new());
        let volume = FINDINGS_BUFFER * 3 + 7;
        let adapter = adapter(ScanBehavior::Findings(volume), store.clone());

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            adapter.execute(&job("example.com"), &staged(), &CancellationToken::new()),
        )
        .await
        .expect("a full findings channel must not stall the scan");

        match outcome {
            ScanOutcome::Completed { findings, result_refs, .. } => {
                assert_eq!(findings, volume);
                assert_eq!(result_refs.len(), volume);
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_monotonic_stamps() {
        let stamps = MonotonicMillis::default();
        assert_eq!(stamps.next(100), 100);
        assert_eq!(stamps.next(100), 101);
        assert_eq!(stamps.next(50), 102);
        assert_eq!(stamps.next(500), 500);
    }

    #[test]
    fn test_result_key_shape() {
        assert_eq!(
            result_key("job-1", "cve-2024-1", "example.com", 1700000000000),
            "job-1/cve-2024-1_example.com_1700000000000.json"
        );
    }
}
