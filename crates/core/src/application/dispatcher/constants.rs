// Dispatcher constants (no magic values)
use std::time::Duration;

/// Ceiling for a single scan, measured from invocation (2 hours)
pub const DEFAULT_SCAN_DEADLINE: Duration = Duration::from_secs(2 * 60 * 60);

/// Time a cancelled executor gets to wind down before it is dropped (5 seconds)
pub const EXECUTOR_TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Findings a scan may run ahead of the adapter before its sends wait
pub const FINDINGS_BUFFER: usize = 256;

/// Upper bound on how long shutdown waits for in-flight scans (1 minute)
pub const MAX_SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Default size of the concurrency permit pool
pub const DEFAULT_MAX_CONCURRENT_SCANS: usize = 4;

/// Sleep between polls of an empty queue in poll mode (2 seconds)
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Reconnect budget for the queue transport
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Linear reconnect delay step (2s, 4s, 6s, ...)
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Compare-and-swap attempts for one batch aggregation
pub const CAS_MAX_ATTEMPTS: u32 = 16;

/// Base delay between lost compare-and-swap races (10ms, exponential with jitter)
pub const CAS_BASE_DELAY: Duration = Duration::from_millis(10);

/// Attempts for job status writes before the outcome is considered unrecordable
pub const STORE_WRITE_ATTEMPTS: u32 = 3;

/// Base delay between job status write attempts (100ms, exponential with jitter)
pub const STORE_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Memory usage above which new messages are not admitted (percent)
pub const MEMORY_ADMISSION_THRESHOLD: f32 = 90.0;

/// Wait before re-checking memory pressure (5 seconds)
pub const MEMORY_BACKOFF: Duration = Duration::from_secs(5);

/// Default retry base delay for opt-in job retries (1000ms = 1s)
pub const DEFAULT_RETRY_BASE_DELAY_MS: i64 = 1000;

/// How often the schedule trigger fires (1 minute)
pub const DEFAULT_TRIGGER_INTERVAL: Duration = Duration::from_secs(60);

/// Batch label used when a scheduled request carries no name
pub const SCHEDULED_BATCH_NAME: &str = "Scheduled Scan";
