//! JSON-RPC Server
//!
//! JSON-RPC 2.0 over HTTP. Binds to localhost by default; there is no
//! authentication, so exposing it beyond the host is the operator's call.

use crate::handler::{RpcDeps, RpcHandler};
use crate::types::{
    BatchGetRequest, BatchListRequest, JobGetRequest, JobListRequest, RuleUpsertRequest,
    ScanBatchRequest, ScanSingleRequest, ScheduleCreateRequest, ScheduleDeleteRequest,
    TargetUpsertRequest,
};
use jsonrpsee::core::RegisterMethodError;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::RpcModule;
use std::net::SocketAddr;
use tracing::info;

pub const DEFAULT_RPC_BIND: &str = "127.0.0.1:9527";

/// RPC Server Configuration
pub struct RpcServerConfig {
    pub bind: String,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_RPC_BIND.to_string(),
        }
    }
}

/// RPC Server
pub struct RpcServer {
    config: RpcServerConfig,
    handler: RpcHandler,
}

/// Register every method on a module whose context is the handler
pub fn build_module(handler: RpcHandler) -> Result<RpcModule<RpcHandler>, RegisterMethodError> {
    let mut module = RpcModule::new(handler);

    module.register_async_method("scan.batch.v1", |params, handler, _| async move {
        let req: ScanBatchRequest = params.parse()?;
        handler.scan_batch(req).await
    })?;

    module.register_async_method("scan.single.v1", |params, handler, _| async move {
        let req: ScanSingleRequest = params.parse()?;
        handler.scan_single(req).await
    })?;

    module.register_async_method("schedule.create.v1", |params, handler, _| async move {
        let req: ScheduleCreateRequest = params.parse()?;
        handler.create_schedule(req).await
    })?;

    module.register_async_method("schedule.list.v1", |_, handler, _| async move {
        handler.list_schedules().await
    })?;

    module.register_async_method("schedule.delete.v1", |params, handler, _| async move {
        let req: ScheduleDeleteRequest = params.parse()?;
        handler.delete_schedule(req).await
    })?;

    module.register_async_method("job.get.v1", |params, handler, _| async move {
        let req: JobGetRequest = params.parse()?;
        handler.get_job(req).await
    })?;

    module.register_async_method("job.list.v1", |params, handler, _| async move {
        let req: JobListRequest = params.parse()?;
        handler.list_jobs(req).await
    })?;

    module.register_async_method("batch.get.v1", |params, handler, _| async move {
        let req: BatchGetRequest = params.parse()?;
        handler.get_batch(req).await
    })?;

    module.register_async_method("batch.list.v1", |params, handler, _| async move {
        let req: BatchListRequest = params.parse()?;
        handler.list_batches(req).await
    })?;

    module.register_async_method("target.upsert.v1", |params, handler, _| async move {
        let req: TargetUpsertRequest = params.parse()?;
        handler.upsert_target(req).await
    })?;

    module.register_async_method("rule.upsert.v1", |params, handler, _| async move {
        let req: RuleUpsertRequest = params.parse()?;
        handler.upsert_rule(req).await
    })?;

    module.register_async_method("stats.v1", |_, handler, _| async move {
        handler.stats().await
    })?;

    Ok(module)
}

impl RpcServer {
    pub fn new(config: RpcServerConfig, deps: RpcDeps) -> Self {
        Self {
            config,
            handler: RpcHandler::new(deps),
        }
    }

    /// Bind and start serving; the returned handle stops the server
    pub async fn start(self) -> Result<(ServerHandle, SocketAddr), String> {
        let server = Server::builder()
            .build(&self.config.bind)
            .await
            .map_err(|e| format!("Failed to build server on {}: {}", self.config.bind, e))?;
        let addr = server
            .local_addr()
            .map_err(|e| format!("Failed to read bound address: {}", e))?;

        let module = build_module(self.handler).map_err(|e| e.to_string())?;
        let method_count = module.method_names().count();

        info!(addr = %addr, methods = method_count, "JSON-RPC server started");
        Ok((server.start(module), addr))
    }
}
