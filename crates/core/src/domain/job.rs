// Job Domain Model

use serde::{Deserialize, Serialize};

use super::batch::BatchId;
use super::error::{DomainError, Result};
use super::finding::RuleId;

/// Job ID (UUID v4, canonical string form)
pub type JobId = String;

/// Target ID
pub type TargetId = String;

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in-progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in-progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Which rules a job runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSelection {
    All,
    Explicit(Vec<RuleId>),
}

impl RuleSelection {
    /// Build from the wire pair (`rule_ids`, `scan_all`).
    ///
    /// `scan_all` wins when both are present.
    pub fn from_parts(rule_ids: Vec<RuleId>, scan_all: bool) -> Result<Self> {
        if scan_all {
            return Ok(RuleSelection::All);
        }
        if rule_ids.is_empty() {
            return Err(DomainError::ValidationError(
                "rule selection is empty".to_string(),
            ));
        }
        Ok(RuleSelection::Explicit(rule_ids))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, RuleSelection::All)
    }

    pub fn rule_ids(&self) -> &[RuleId] {
        match self {
            RuleSelection::All => &[],
            RuleSelection::Explicit(ids) => ids,
        }
    }
}

/// Scan target (a host plus its catalog identity)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub host: String,
}

impl Target {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
        }
    }
}

/// Structured failure record attached to a failed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    pub context: String,
    /// RFC 3339
    pub timestamp: String,
    pub duration_ms: i64,
    #[serde(default)]
    pub rules_attempted: u32,
    #[serde(default)]
    pub findings_collected: u32,
    #[serde(default)]
    pub timed_out: bool,
}

impl ErrorDetail {
    pub fn new(
        context: impl Into<String>,
        message: impl Into<String>,
        now_millis: i64,
        duration_ms: i64,
    ) -> Self {
        Self {
            message: message.into(),
            context: context.into(),
            timestamp: rfc3339(now_millis),
            duration_ms,
            rules_attempted: 0,
            findings_collected: 0,
            timed_out: false,
        }
    }

    pub fn with_counts(mut self, rules_attempted: u32, findings_collected: u32) -> Self {
        self.rules_attempted = rules_attempted;
        self.findings_collected = findings_collected;
        self
    }

    pub fn timed_out(mut self) -> Self {
        self.timed_out = true;
        self
    }

    /// Human-readable one-liner
    pub fn describe(&self) -> String {
        format!("{}: {}", self.context, self.message)
    }
}

fn rfc3339(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .unwrap_or_default()
        .to_rfc3339()
}

/// Job Entity: one target scanned against one rule selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub batch_id: Option<BatchId>,
    pub target: Target,
    pub rules: RuleSelection,
    pub status: JobStatus,

    pub error: Option<ErrorDetail>,
    pub result_refs: Vec<String>,

    pub scheduled_at: i64, // epoch ms
    pub started_at: Option<i64>,
    pub duration_ms: Option<i64>,

    /// Incremented on every `in-progress` transition
    pub attempts: i32,
}

impl Job {
    /// Create a new pending job
    ///
    /// # Arguments
    ///
    /// * `id` - Unique job ID (injected, not generated)
    /// * `batch_id` - Owning batch, `None` for ad-hoc single scans
    /// * `scheduled_at` - Creation timestamp in epoch ms (injected, not system time)
    pub fn new(
        id: impl Into<String>,
        batch_id: Option<BatchId>,
        target: Target,
        rules: RuleSelection,
        scheduled_at: i64,
    ) -> Self {
        Self {
            id: id.into(),
            batch_id,
            target,
            rules,
            status: JobStatus::Pending,
            error: None,
            result_refs: Vec::new(),
            scheduled_at,
            started_at: None,
            duration_ms: None,
            attempts: 0,
        }
    }

    /// Transition to in-progress.
    ///
    /// Allowed again while already in progress: a redelivered message restarts
    /// execution from scratch and resets the timer.
    pub fn start(&mut self, now_millis: i64) -> Result<()> {
        if self.status.is_terminal() {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: JobStatus::InProgress.to_string(),
            });
        }
        self.status = JobStatus::InProgress;
        self.started_at = Some(now_millis);
        self.attempts += 1;
        Ok(())
    }

    pub fn complete(&mut self, result_refs: Vec<String>, duration_ms: i64) -> Result<()> {
        self.ensure_running(JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.result_refs = result_refs;
        self.duration_ms = Some(duration_ms);
        Ok(())
    }

    pub fn fail(&mut self, detail: ErrorDetail, duration_ms: i64) -> Result<()> {
        self.ensure_running(JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.error = Some(detail);
        self.duration_ms = Some(duration_ms);
        Ok(())
    }

    fn ensure_running(&self, to: JobStatus) -> Result<()> {
        if self.status != JobStatus::InProgress {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }
}
