// Scanfleet Infrastructure - SQLite Adapter
// Implements: JobStore, ScheduleStore, TargetCatalog, RuleCatalog, QueueConnector

mod catalog;
mod connection;
mod job_store;
mod migration;
mod queue;
mod sql_error;

pub use connection::create_pool;
pub use job_store::SqliteScanStore;
pub use migration::run_migrations;
pub use queue::{
    SqliteQueueChannel, SqliteQueueConnector, DEFAULT_QUEUE_NAME, DEFAULT_VISIBILITY_TIMEOUT,
};
