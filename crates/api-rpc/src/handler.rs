//! RPC Method Handlers
//!
//! Thin glue: parse, delegate to a port or application service, map errors.

use crate::error::{to_rpc_error, validation};
use crate::types::{
    BatchGetRequest, BatchGetResponse, BatchListRequest, BatchListResponse, JobGetRequest,
    JobListRequest, JobListResponse, RuleUpsertRequest, ScanBatchRequest, ScanBatchResponse,
    ScanSingleRequest, ScanSingleResponse, ScheduleCreateRequest, ScheduleCreateResponse,
    ScheduleDeleteRequest, ScheduleDeleteResponse, ScheduleListResponse, StatsResponse,
    TargetUpsertRequest, UpsertResponse,
};
use jsonrpsee::types::ErrorObjectOwned;
use scanfleet_core::application::SchedulingPublisher;
use scanfleet_core::domain::{
    Job, JobStatus, Rule, RuleSelection, ScheduledRequest, Target, TargetSelector,
};
use scanfleet_core::error::AppError;
use scanfleet_core::port::{
    IdProvider, JobFilter, JobStore, RuleCatalog, ScheduleStore, TargetCatalog, TimeProvider,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

type RpcResult<T> = Result<T, ErrorObjectOwned>;

/// Batch label for ad-hoc batches submitted without a name
const ADHOC_BATCH_NAME: &str = "Ad-hoc Scan";

/// Everything the handlers talk to
pub struct RpcDeps {
    pub store: Arc<dyn JobStore>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub targets: Arc<dyn TargetCatalog>,
    pub rules: Arc<dyn RuleCatalog>,
    pub publisher: Arc<SchedulingPublisher>,
    pub id_provider: Arc<dyn IdProvider>,
    pub time_provider: Arc<dyn TimeProvider>,
}

/// RPC Handler with injected dependencies
pub struct RpcHandler {
    deps: RpcDeps,
    start_time: Instant,
}

fn rule_selection(rule_ids: Vec<String>, scan_all: bool) -> RpcResult<RuleSelection> {
    RuleSelection::from_parts(rule_ids, scan_all).map_err(|e| to_rpc_error(e.into()))
}

fn target_selector(target_ids: Option<Vec<String>>) -> RpcResult<TargetSelector> {
    match target_ids {
        None => Ok(TargetSelector::All),
        Some(ids) if ids.is_empty() => Err(validation("target_ids is empty")),
        Some(ids) => Ok(TargetSelector::Explicit(ids)),
    }
}

fn require(field: &str, value: &str) -> RpcResult<()> {
    if value.trim().is_empty() {
        return Err(validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

impl RpcHandler {
    pub fn new(deps: RpcDeps) -> Self {
        Self {
            deps,
            start_time: Instant::now(),
        }
    }

    /// scan.batch.v1
    pub async fn scan_batch(&self, params: ScanBatchRequest) -> RpcResult<ScanBatchResponse> {
        let targets = target_selector(params.target_ids)?;
        let rules = rule_selection(params.rule_ids, params.scan_all)?;
        let name = params.name.unwrap_or_else(|| ADHOC_BATCH_NAME.to_string());

        let report = self
            .deps
            .publisher
            .submit_batch(&name, &targets, &rules)
            .await
            .map_err(to_rpc_error)?;
        Ok(report.into())
    }

    /// scan.single.v1
    pub async fn scan_single(&self, params: ScanSingleRequest) -> RpcResult<ScanSingleResponse> {
        require("target_id", &params.target_id)?;
        let rules = rule_selection(params.rule_ids, params.scan_all)?;

        let job_id = self
            .deps
            .publisher
            .submit_single(&params.target_id, &rules)
            .await
            .map_err(to_rpc_error)?;
        Ok(ScanSingleResponse { job_id })
    }

    /// schedule.create.v1
    pub async fn create_schedule(
        &self,
        params: ScheduleCreateRequest,
    ) -> RpcResult<ScheduleCreateResponse> {
        let request = ScheduledRequest {
            id: self.deps.id_provider.generate_id(),
            name: params.name,
            targets: target_selector(params.target_ids)?,
            rules: rule_selection(params.rule_ids, params.scan_all)?,
            trigger_date: params.trigger_date,
            created_at: self.deps.time_provider.now_millis(),
        };

        self.deps
            .schedules
            .create_schedule(&request)
            .await
            .map_err(to_rpc_error)?;

        info!(schedule_id = %request.id, trigger_date = %request.trigger_date, "Schedule created");
        Ok(ScheduleCreateResponse {
            schedule_id: request.id,
            trigger_date: request.trigger_date,
        })
    }

    /// schedule.list.v1
    pub async fn list_schedules(&self) -> RpcResult<ScheduleListResponse> {
        let schedules = self
            .deps
            .schedules
            .list_schedules()
            .await
            .map_err(to_rpc_error)?;
        Ok(ScheduleListResponse { schedules })
    }

    /// schedule.delete.v1
    pub async fn delete_schedule(
        &self,
        params: ScheduleDeleteRequest,
    ) -> RpcResult<ScheduleDeleteResponse> {
        let deleted = self
            .deps
            .schedules
            .delete_schedule(&params.schedule_id)
            .await
            .map_err(to_rpc_error)?;

        if !deleted {
            return Err(to_rpc_error(AppError::NotFound(format!(
                "Schedule {} not found",
                params.schedule_id
            ))));
        }
        Ok(ScheduleDeleteResponse {
            schedule_id: params.schedule_id,
            deleted,
        })
    }

    /// job.get.v1
    pub async fn get_job(&self, params: JobGetRequest) -> RpcResult<Job> {
        self.deps
            .store
            .find_job(&params.job_id)
            .await
            .map_err(to_rpc_error)?
            .ok_or_else(|| {
                to_rpc_error(AppError::NotFound(format!("Job {} not found", params.job_id)))
            })
    }

    /// job.list.v1
    pub async fn list_jobs(&self, params: JobListRequest) -> RpcResult<JobListResponse> {
        let status = params
            .status
            .as_deref()
            .map(str::parse::<JobStatus>)
            .transpose()
            .map_err(|e| to_rpc_error(e.into()))?;

        let filter = JobFilter {
            status,
            batch_id: params.batch_id,
            limit: Some(params.limit),
        };
        let jobs = self
            .deps
            .store
            .list_jobs(&filter)
            .await
            .map_err(to_rpc_error)?;
        Ok(JobListResponse { jobs })
    }

    /// batch.get.v1
    pub async fn get_batch(&self, params: BatchGetRequest) -> RpcResult<BatchGetResponse> {
        let batch = self
            .deps
            .store
            .find_batch(&params.batch_id)
            .await
            .map_err(to_rpc_error)?
            .ok_or_else(|| {
                to_rpc_error(AppError::NotFound(format!(
                    "Batch {} not found",
                    params.batch_id
                )))
            })?;

        let jobs = if params.include_jobs {
            Some(
                self.deps
                    .store
                    .find_jobs_by_batch(&batch.id)
                    .await
                    .map_err(to_rpc_error)?,
            )
        } else {
            None
        };

        Ok(BatchGetResponse {
            processed: batch.processed(),
            batch,
            jobs,
        })
    }

    /// batch.list.v1
    pub async fn list_batches(&self, params: BatchListRequest) -> RpcResult<BatchListResponse> {
        let batches = self
            .deps
            .store
            .list_batches(params.limit)
            .await
            .map_err(to_rpc_error)?;
        Ok(BatchListResponse { batches })
    }

    /// target.upsert.v1
    pub async fn upsert_target(&self, params: TargetUpsertRequest) -> RpcResult<UpsertResponse> {
        require("id", &params.id)?;
        require("host", &params.host)?;

        let target = Target::new(params.id, params.host.trim());
        self.deps
            .targets
            .upsert_target(&target)
            .await
            .map_err(to_rpc_error)?;
        Ok(UpsertResponse { id: target.id })
    }

    /// rule.upsert.v1
    pub async fn upsert_rule(&self, params: RuleUpsertRequest) -> RpcResult<UpsertResponse> {
        require("id", &params.id)?;
        require("locator", &params.locator)?;

        let rule = Rule {
            id: params.id,
            name: params.name,
            locator: params.locator,
        };
        self.deps
            .rules
            .upsert_rule(&rule)
            .await
            .map_err(to_rpc_error)?;
        Ok(UpsertResponse { id: rule.id })
    }

    /// stats.v1
    pub async fn stats(&self) -> RpcResult<StatsResponse> {
        let jobs = self
            .deps
            .store
            .count_jobs_by_status()
            .await
            .map_err(to_rpc_error)?;
        let open_batches = self
            .deps
            .store
            .find_open_batches()
            .await
            .map_err(to_rpc_error)?
            .len();
        let pending_schedules = self
            .deps
            .schedules
            .list_schedules()
            .await
            .map_err(to_rpc_error)?
            .len();

        Ok(StatsResponse {
            jobs,
            open_batches,
            pending_schedules,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code;
    use chrono::NaiveDate;
    use scanfleet_core::application::ReconnectingTransport;
    use scanfleet_core::port::id_provider::mocks::SequentialIdProvider;
    use scanfleet_core::port::job_store::mocks::InMemoryStore;
    use scanfleet_core::port::queue::mocks::InMemoryBroker;
    use scanfleet_core::port::time_provider::mocks::ManualClock;

    async fn handler() -> (RpcHandler, Arc<InMemoryBroker>) {
        let store = Arc::new(InMemoryStore::new());
        let broker = InMemoryBroker::new();
        let transport = ReconnectingTransport::connect(Arc::new(Arc::clone(&broker)))
            .await
            .unwrap();
        let ids = Arc::new(SequentialIdProvider::new("id"));
        let clock = Arc::new(ManualClock::new(0));
        let publisher = Arc::new(SchedulingPublisher::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(transport),
            ids.clone(),
            clock.clone(),
        ));
        let handler = RpcHandler::new(RpcDeps {
            store: store.clone(),
            schedules: store.clone(),
            targets: store.clone(),
            rules: store,
            publisher,
            id_provider: ids,
            time_provider: clock,
        });
        (handler, broker)
    }

    async fn add_target(handler: &RpcHandler, id: &str) {
        handler
            .upsert_target(TargetUpsertRequest {
                id: id.into(),
                host: format!("{}.example.com", id),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_batch_submission_and_lookup() {
        let (handler, broker) = handler().await;
        add_target(&handler, "t-1").await;
        add_target(&handler, "t-2").await;

        let report = handler
            .scan_batch(ScanBatchRequest {
                name: None,
                target_ids: Some(vec!["t-1".into(), "t-2".into(), "t-404".into()]),
                rule_ids: vec!["cve-1".into()],
                scan_all: false,
            })
            .await
            .unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.published, 2);
        assert_eq!(report.failed_targets, vec!["t-404".to_string()]);
        assert_eq!(broker.ready_len(), 2);

        let view = handler
            .get_batch(BatchGetRequest {
                batch_id: report.batch_id.clone(),
                include_jobs: true,
            })
            .await
            .unwrap();
        assert_eq!(view.batch.name, ADHOC_BATCH_NAME);
        assert_eq!(view.processed, 0);
        assert_eq!(view.jobs.unwrap().len(), 2);

        let listed = handler
            .list_jobs(JobListRequest {
                status: Some("pending".into()),
                batch_id: Some(report.batch_id),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(listed.jobs.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_target_list_is_rejected() {
        let (handler, _) = handler().await;
        let err = handler
            .scan_batch(ScanBatchRequest {
                name: Some("none".into()),
                target_ids: Some(vec![]),
                rule_ids: vec![],
                scan_all: true,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), code::VALIDATION_ERROR);
    }

    #[tokio::test]
    async fn test_schedule_lifecycle() {
        let (handler, _) = handler().await;

        let created = handler
            .create_schedule(ScheduleCreateRequest {
                name: Some("weekly".into()),
                target_ids: None,
                rule_ids: vec![],
                scan_all: true,
                trigger_date: NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(),
            })
            .await
            .unwrap();

        let listed = handler.list_schedules().await.unwrap();
        assert_eq!(listed.schedules.len(), 1);
        assert_eq!(listed.schedules[0].targets, TargetSelector::All);

        let deleted = handler
            .delete_schedule(ScheduleDeleteRequest {
                schedule_id: created.schedule_id.clone(),
            })
            .await
            .unwrap();
        assert!(deleted.deleted);

        let again = handler
            .delete_schedule(ScheduleDeleteRequest {
                schedule_id: created.schedule_id,
            })
            .await
            .unwrap_err();
        assert_eq!(again.code(), code::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upserts_validate_input() {
        let (handler, _) = handler().await;

        let err = handler
            .upsert_target(TargetUpsertRequest {
                id: "t-1".into(),
                host: "  ".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), code::VALIDATION_ERROR);

        let ok = handler
            .upsert_rule(RuleUpsertRequest {
                id: "cve-1".into(),
                name: "CVE 1".into(),
                locator: "file:///rules/cve-1.yaml".into(),
            })
            .await
            .unwrap();
        assert_eq!(ok.id, "cve-1");
    }

    #[tokio::test]
    async fn test_stats_counts_jobs() {
        let (handler, _) = handler().await;
        add_target(&handler, "t-1").await;
        handler
            .scan_single(ScanSingleRequest {
                target_id: "t-1".into(),
                rule_ids: vec![],
                scan_all: true,
            })
            .await
            .unwrap();

        let stats = handler.stats().await.unwrap();
        assert_eq!(stats.jobs.pending, 1);
        assert_eq!(stats.open_batches, 0);
    }
}
