//! Scanfleet Daemon - Main Entry Point
//!
//! Composition root: wires the SQLite store and queue, the scanner process
//! adapter, the dispatcher, the schedule trigger and the JSON-RPC server.

mod config;
mod telemetry;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use scanfleet_api_rpc::{RpcDeps, RpcServer, RpcServerConfig};
use scanfleet_core::application::dispatcher::constants::EXECUTOR_TERMINATION_GRACE;
use scanfleet_core::application::{
    shutdown_channel, BatchAggregator, BatchReconciler, Dispatcher, DispatcherDeps,
    ExecutorAdapter, ReconnectingTransport, ScheduleTrigger, SchedulingPublisher, ShutdownToken,
};
use scanfleet_core::port::id_provider::UuidProvider;
use scanfleet_core::port::time_provider::SystemTimeProvider;
use scanfleet_core::port::{IdProvider, NoopNotifier, Notifier, SystemProbe, TimeProvider};
use scanfleet_infra_sqlite::{create_pool, run_migrations, SqliteQueueConnector, SqliteScanStore};
use scanfleet_infra_system::{
    CommandScanExecutor, FsObjectStore, FsRuleStager, SystemProbeImpl, WebhookNotifier,
};

use crate::config::{LogFormat, Settings};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_logging(format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Failed to create env filter")?;

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(telemetry::otlp_layer()?);

    match format {
        // Production: JSON structured logging
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init()?,
    }
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

/// Run the dispatcher to completion; a dispatcher failure is fatal for the process
async fn run_worker(dispatcher: Dispatcher, token: ShutdownToken) -> Result<()> {
    match dispatcher.run(token).await {
        Ok(summary) => {
            info!(
                received = summary.received,
                succeeded = summary.succeeded,
                failed = summary.failed,
                malformed = summary.malformed,
                abandoned = summary.abandoned,
                "Dispatcher stopped"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Dispatcher failed");
            Err(anyhow::Error::new(e).context("Dispatcher failed"))
        }
    }
}

fn worker_exit(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined.map_err(|e| anyhow::anyhow!("Worker task crashed: {}", e))?
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Configuration first: it decides the log format
    let settings = Settings::load().context("Failed to load configuration")?;
    init_logging(settings.logging.format)?;
    telemetry::report();

    info!(version = VERSION, "Scanfleet daemon starting");

    // 2. Database
    info!(url = %settings.database.url, "Initializing database");
    let pool = create_pool(&settings.database.url)
        .await
        .context("DB pool creation failed")?;
    run_migrations(&pool).await.context("Migration failed")?;

    // 3. Dependencies
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let id_provider: Arc<dyn IdProvider> = Arc::new(UuidProvider);
    let store = Arc::new(SqliteScanStore::new(pool.clone()));

    let connector = SqliteQueueConnector::new(pool.clone(), time_provider.clone())
        .with_queue(settings.queue.name.clone())
        .with_visibility_timeout(Duration::from_secs(settings.queue.visibility_timeout_secs));
    let transport = ReconnectingTransport::connect(Arc::new(connector))
        .await
        .context("Queue connection failed")?
        .with_reconnect_policy(
            settings.queue.reconnect_attempts,
            Duration::from_millis(settings.queue.reconnect_base_delay_ms),
        );
    let transport = Arc::new(transport);

    let notifier: Arc<dyn Notifier> = match &settings.notifier.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => {
            info!("No webhook configured, notifications are dropped");
            Arc::new(NoopNotifier)
        }
    };

    let aggregator = Arc::new(BatchAggregator::new(
        store.clone(),
        notifier.clone(),
        time_provider.clone(),
    ));

    let publisher = Arc::new(SchedulingPublisher::new(
        store.clone(),
        store.clone(),
        store.clone(),
        transport.clone(),
        id_provider.clone(),
        time_provider.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = shutdown_channel();

    // 4. Worker
    let worker_handle = if settings.worker.enabled {
        let objects = Arc::new(FsObjectStore::new(&settings.object_store.root_dir));
        let stager = FsRuleStager::new(objects.clone(), &settings.worker.staging_dir);
        match stager.purge_stale().await {
            Ok(0) => {}
            Ok(count) => info!(count = count, "Purged stale staging directories"),
            Err(e) => warn!(error = %e, "Failed to purge staging directory"),
        }

        let executor = CommandScanExecutor::new(&settings.executor.binary)
            .with_extra_args(settings.executor.extra_args.clone())
            .with_env_allowlist(settings.executor.env_allowlist.clone())
            .with_all_rules_dir(settings.executor.all_rules_dir.clone())
            .with_termination_grace(EXECUTOR_TERMINATION_GRACE);
        let adapter = ExecutorAdapter::new(Arc::new(executor), objects, time_provider.clone())
            .with_deadline(settings.scan_deadline())
            .with_termination_grace(EXECUTOR_TERMINATION_GRACE);

        let probe: Arc<dyn SystemProbe> = Arc::new(SystemProbeImpl::new());
        let dispatcher = Dispatcher::new(
            DispatcherDeps {
                transport: transport.clone(),
                store: store.clone(),
                rules: store.clone(),
                stager: Arc::new(stager),
                adapter: Arc::new(adapter),
                aggregator: aggregator.clone(),
                notifier: notifier.clone(),
                time_provider: time_provider.clone(),
                probe: Some(probe),
            },
            settings.dispatcher_config(),
        );

        Some(tokio::spawn(run_worker(dispatcher, shutdown_rx.clone())))
    } else {
        info!("Worker disabled");
        None
    };

    // 5. Schedule trigger and batch reconciliation
    let trigger_handle = if settings.scheduler.enabled {
        let reconciler = BatchReconciler::new(store.clone(), aggregator.clone(), time_provider.clone())
            .with_stale_after(settings.stale_batch_timeout());
        let trigger = ScheduleTrigger::new(publisher.clone(), time_provider.clone())
            .with_reconciler(Arc::new(reconciler))
            .with_interval(Duration::from_secs(settings.scheduler.interval_secs));
        Some(tokio::spawn(trigger.run(shutdown_rx.clone())))
    } else {
        info!("Scheduler disabled");
        None
    };

    // 6. JSON-RPC server
    let rpc_handle = if settings.rpc.enabled {
        let deps = RpcDeps {
            store: store.clone(),
            schedules: store.clone(),
            targets: store.clone(),
            rules: store.clone(),
            publisher,
            id_provider,
            time_provider,
        };
        let config = RpcServerConfig {
            bind: settings.rpc.bind.clone(),
        };
        let (handle, _addr) = RpcServer::new(config, deps)
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("RPC server start failed: {}", e))?;
        Some(handle)
    } else {
        None
    };

    info!("System ready");

    // 7. Wait for SIGINT/SIGTERM, or for a drain-mode worker to finish
    let mut worker_handle = worker_handle;
    let mut worker_result: Result<()> = Ok(());
    let worker_finished = match worker_handle.as_mut() {
        Some(handle) => {
            tokio::select! {
                result = wait_for_signal() => {
                    result?;
                    info!("Shutdown signal received");
                    false
                }
                joined = handle => {
                    info!("Worker finished");
                    worker_result = worker_exit(joined);
                    true
                }
            }
        }
        None => {
            wait_for_signal().await?;
            info!("Shutdown signal received");
            false
        }
    };
    if worker_finished {
        worker_handle = None;
    }

    // 8. Graceful shutdown: stop intake, let in-flight scans drain
    shutdown_tx.shutdown();
    if let Some(handle) = rpc_handle {
        if let Err(e) = handle.stop() {
            warn!(error = %e, "RPC server already stopped");
        }
    }

    // The dispatcher bounds its own drain by the shutdown grace
    let drain_limit = Duration::from_secs(settings.worker.shutdown_grace_secs)
        + EXECUTOR_TERMINATION_GRACE * 2;
    if let Some(handle) = worker_handle {
        match tokio::time::timeout(drain_limit, handle).await {
            Ok(joined) => worker_result = worker_exit(joined),
            Err(_) => warn!("Worker did not stop within the drain limit"),
        }
    }
    if let Some(handle) = trigger_handle {
        let _ = handle.await;
    }

    pool.close().await;
    telemetry::shutdown();
    worker_result?;
    info!("Shutdown complete");

    Ok(())
}
