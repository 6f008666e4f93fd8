//! RPC Request/Response Types
//!
//! Parameters are passed by name (JSON object). Target and rule selections use
//! the same shape everywhere: `target_ids` absent means every catalog target,
//! `scan_all` wins over `rule_ids`.

use chrono::NaiveDate;
use scanfleet_core::application::PublishReport;
use scanfleet_core::domain::{Batch, Job, ScheduledRequest};
use scanfleet_core::port::StatusCounts;
use serde::{Deserialize, Serialize};

fn default_job_limit() -> u32 {
    50
}

fn default_batch_limit() -> u32 {
    20
}

/// scan.batch.v1 - Fan out an ad-hoc batch
#[derive(Debug, Deserialize)]
pub struct ScanBatchRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub target_ids: Option<Vec<String>>,
    #[serde(default)]
    pub rule_ids: Vec<String>,
    #[serde(default)]
    pub scan_all: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanBatchResponse {
    pub batch_id: String,
    pub total: u32,
    pub published: u32,
    pub failed_targets: Vec<String>,
}

impl From<PublishReport> for ScanBatchResponse {
    fn from(report: PublishReport) -> Self {
        Self {
            batch_id: report.batch_id,
            total: report.total,
            published: report.published,
            failed_targets: report.failed_targets,
        }
    }
}

/// scan.single.v1 - One job, no batch
#[derive(Debug, Deserialize)]
pub struct ScanSingleRequest {
    pub target_id: String,
    #[serde(default)]
    pub rule_ids: Vec<String>,
    #[serde(default)]
    pub scan_all: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSingleResponse {
    pub job_id: String,
}

/// schedule.create.v1
#[derive(Debug, Deserialize)]
pub struct ScheduleCreateRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub target_ids: Option<Vec<String>>,
    #[serde(default)]
    pub rule_ids: Vec<String>,
    #[serde(default)]
    pub scan_all: bool,
    /// `YYYY-MM-DD`
    pub trigger_date: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleCreateResponse {
    pub schedule_id: String,
    pub trigger_date: NaiveDate,
}

/// schedule.list.v1 (no parameters)
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleListResponse {
    pub schedules: Vec<ScheduledRequest>,
}

/// schedule.delete.v1
#[derive(Debug, Deserialize)]
pub struct ScheduleDeleteRequest {
    pub schedule_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDeleteResponse {
    pub schedule_id: String,
    pub deleted: bool,
}

/// job.get.v1
#[derive(Debug, Deserialize)]
pub struct JobGetRequest {
    pub job_id: String,
}

/// job.list.v1
#[derive(Debug, Deserialize)]
pub struct JobListRequest {
    /// `pending`, `in-progress`, `completed` or `failed`
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default = "default_job_limit")]
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
}

/// batch.get.v1
#[derive(Debug, Deserialize)]
pub struct BatchGetRequest {
    pub batch_id: String,
    #[serde(default)]
    pub include_jobs: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchGetResponse {
    pub batch: Batch,
    pub processed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<Vec<Job>>,
}

/// batch.list.v1
#[derive(Debug, Deserialize)]
pub struct BatchListRequest {
    #[serde(default = "default_batch_limit")]
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchListResponse {
    pub batches: Vec<Batch>,
}

/// target.upsert.v1
#[derive(Debug, Deserialize)]
pub struct TargetUpsertRequest {
    pub id: String,
    pub host: String,
}

/// rule.upsert.v1
#[derive(Debug, Deserialize)]
pub struct RuleUpsertRequest {
    pub id: String,
    pub name: String,
    /// Object store locator of the rule artifact
    pub locator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertResponse {
    pub id: String,
}

/// stats.v1 (no parameters)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub jobs: StatusCounts,
    pub open_batches: usize,
    pub pending_schedules: usize,
    pub uptime_seconds: u64,
}
