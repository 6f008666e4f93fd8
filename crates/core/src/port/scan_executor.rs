// Scan Executor Port
// Abstraction over the external vulnerability-probing engine

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::domain::{Finding, JobId};

/// What to scan and with which staged rule files
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub job_id: JobId,
    pub target: String,
    pub rule_paths: Vec<PathBuf>,
    pub scan_all: bool,
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Rule load failed: {0}")]
    RuleLoad(String),

    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),

    #[error("Executor failed to start: {0}")]
    Spawn(String),

    #[error("Executor failed: {0}")]
    Failed(String),

    #[error("Scan cancelled")]
    Cancelled,
}

/// Scan Executor trait
///
/// Findings are streamed through `findings` as they are produced so a caller
/// that gives up early still knows what was collected. The channel is bounded;
/// a send waits while the consumer is behind. Implementations must stop
/// promptly once `cancel` fires.
#[async_trait]
pub trait ScanExecutor: Send + Sync {
    async fn scan(
        &self,
        request: &ScanRequest,
        findings: Sender<Finding>,
        cancel: CancellationToken,
    ) -> Result<(), ScanError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Mock executor behavior
    #[derive(Debug, Clone)]
    pub enum ScanBehavior {
        /// Emit N findings and succeed
        Findings(usize),
        /// Sleep (honoring cancellation), then emit N findings
        Slow(Duration, usize),
        /// Emit N findings, then fail
        FailAfter(usize, String),
        /// Emit N findings, then wait for cancellation
        HangAfter(usize),
        /// Never return, ignoring cancellation
        Stall,
        /// Panic (for panic isolation testing)
        Panic(String),
    }

    /// Mock executor with per-target behavior overrides
    pub struct MockScanExecutor {
        default: ScanBehavior,
        per_target: HashMap<String, ScanBehavior>,
        calls: AtomicUsize,
        requests: Mutex<Vec<ScanRequest>>,
    }

    impl MockScanExecutor {
        pub fn new(default: ScanBehavior) -> Self {
            Self {
                default,
                per_target: HashMap::new(),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn with_target(mut self, target: impl Into<String>, behavior: ScanBehavior) -> Self {
            self.per_target.insert(target.into(), behavior);
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn requests(&self) -> Vec<ScanRequest> {
            self.requests.lock().unwrap().clone()
        }

        async fn emit(request: &ScanRequest, n: usize, sink: &Sender<Finding>) {
            for i in 0..n {
                let rule_id = request
                    .rule_paths
                    .get(i % request.rule_paths.len().max(1))
                    .and_then(|p| p.file_stem())
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "mock-rule".to_string());
                let _ = sink.send(Finding {
                    rule_id,
                    host: request.target.clone(),
                    matched_at: Some(format!("{}/path-{}", request.target, i)),
                    severity: Some("info".to_string()),
                    raw: serde_json::json!({ "index": i }),
                })
                .await;
            }
        }
    }

    #[async_trait]
    impl ScanExecutor for MockScanExecutor {
        async fn scan(
            &self,
            request: &ScanRequest,
            findings: Sender<Finding>,
            cancel: CancellationToken,
        ) -> Result<(), ScanError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());

            let behavior = self
                .per_target
                .get(&request.target)
                .unwrap_or(&self.default)
                .clone();

            match behavior {
                ScanBehavior::Findings(n) => {
                    Self::emit(request, n, &findings).await;
                    Ok(())
                }
                ScanBehavior::Slow(delay, n) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            Self::emit(request, n, &findings).await;
                            Ok(())
                        }
                        _ = cancel.cancelled() => Err(ScanError::Cancelled),
                    }
                }
                ScanBehavior::FailAfter(n, msg) => {
                    Self::emit(request, n, &findings).await;
                    Err(ScanError::TargetUnreachable(msg))
                }
                ScanBehavior::HangAfter(n) => {
                    Self::emit(request, n, &findings).await;
                    cancel.cancelled().await;
                    Err(ScanError::Cancelled)
                }
                ScanBehavior::Stall => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                ScanBehavior::Panic(msg) => {
                    panic!("{}", msg);
                }
            }
        }
    }
}
