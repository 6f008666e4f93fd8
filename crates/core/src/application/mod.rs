// Application Layer - Use Cases and Business Logic

pub mod aggregator;
pub mod dispatcher;
pub mod executor;
pub mod publisher;
pub mod reconciler;
pub mod retry;
pub mod transport;
pub mod trigger;

// Re-exports
pub use aggregator::{BatchAggregator, BatchOutcome};
pub use dispatcher::{
    shutdown_channel, DispatchSummary, Dispatcher, DispatcherConfig, DispatcherDeps, RunMode,
    ShutdownSender, ShutdownToken,
};
pub use executor::{ExecutorAdapter, ScanOutcome};
pub use publisher::{PublishReport, SchedulingPublisher};
pub use reconciler::{BatchReconciler, ReconcileReport};
pub use retry::JobRetryPolicy;
pub use transport::ReconnectingTransport;
pub use trigger::ScheduleTrigger;
