// Port Layer - Interfaces for external dependencies

pub mod catalog;
pub mod id_provider; // For deterministic testing
pub mod job_store;
pub mod notifier;
pub mod object_store;
pub mod queue;
pub mod rule_stager;
pub mod scan_executor;
pub mod schedule_store;
pub mod system_probe;
pub mod time_provider;

// Re-exports
pub use catalog::{RuleCatalog, TargetCatalog};
pub use id_provider::IdProvider;
pub use job_store::{JobFilter, JobStore, StatusCounts};
pub use notifier::{Notification, Notifier, NoopNotifier};
pub use object_store::{ObjectStore, ObjectStoreError};
pub use queue::{Delivery, DeliveryTag, QueueChannel, QueueConnector, QueueTransport, TransportError};
pub use rule_stager::{RuleStager, StagedRules};
pub use scan_executor::{ScanError, ScanExecutor, ScanRequest};
pub use schedule_store::ScheduleStore;
pub use system_probe::{SystemMetrics, SystemProbe};
pub use time_provider::TimeProvider;
