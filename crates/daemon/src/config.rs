//! Daemon configuration
//!
//! Layering, lowest priority first: built-in defaults, an optional TOML file
//! (`scanfleet.toml`, or the path in `SCANFLEET_CONFIG`), then environment
//! variables such as `SCANFLEET__WORKER__MAX_CONCURRENT_SCANS=8`.

use std::path::PathBuf;
use std::time::Duration;

use scanfleet_api_rpc::DEFAULT_RPC_BIND;
use scanfleet_core::application::dispatcher::constants::{
    DEFAULT_MAX_CONCURRENT_SCANS, DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_SCAN_DEADLINE,
    DEFAULT_TRIGGER_INTERVAL, IDLE_POLL_INTERVAL, MAX_SHUTDOWN_GRACE, MEMORY_ADMISSION_THRESHOLD,
    RECONNECT_BASE_DELAY, RECONNECT_MAX_ATTEMPTS,
};
use scanfleet_core::application::{DispatcherConfig, JobRetryPolicy, RunMode};
use scanfleet_infra_sqlite::{DEFAULT_QUEUE_NAME, DEFAULT_VISIBILITY_TIMEOUT};
use scanfleet_infra_system::DEFAULT_ENV_ALLOWLIST;
use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "scanfleet.toml";
const CONFIG_PATH_ENV: &str = "SCANFLEET_CONFIG";
const ENV_PREFIX: &str = "SCANFLEET";

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Configuration file error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub scheduler: SchedulerSettings,
    pub executor: ExecutorSettings,
    pub object_store: ObjectStoreSettings,
    pub notifier: NotifierSettings,
    pub rpc: RpcSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite://scanfleet.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub name: String,
    /// Must exceed the scan deadline plus termination grace
    pub visibility_timeout_secs: u64,
    pub reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE_NAME.to_string(),
            visibility_timeout_secs: DEFAULT_VISIBILITY_TIMEOUT.as_secs(),
            reconnect_attempts: RECONNECT_MAX_ATTEMPTS,
            reconnect_base_delay_ms: RECONNECT_BASE_DELAY.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub enabled: bool,
    pub max_concurrent_scans: usize,
    pub mode: RunMode,
    pub poll_interval_ms: u64,
    pub scan_deadline_secs: u64,
    pub shutdown_grace_secs: u64,
    pub staging_dir: PathBuf,
    pub memory_threshold_percent: f32,
    pub retry: RetrySettings,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_scans: DEFAULT_MAX_CONCURRENT_SCANS,
            mode: RunMode::Poll,
            poll_interval_ms: IDLE_POLL_INTERVAL.as_millis() as u64,
            scan_deadline_secs: DEFAULT_SCAN_DEADLINE.as_secs(),
            shutdown_grace_secs: MAX_SHUTDOWN_GRACE.as_secs(),
            staging_dir: std::env::temp_dir().join("scanfleet-staging"),
            memory_threshold_percent: MEMORY_ADMISSION_THRESHOLD,
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub enabled: bool,
    pub max_attempts: i32,
    pub base_delay_ms: i64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Fail still-pending jobs of batches older than this; unset disables it
    pub stale_batch_timeout_secs: Option<u64>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_TRIGGER_INTERVAL.as_secs(),
            stale_batch_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub binary: PathBuf,
    pub extra_args: Vec<String>,
    pub env_allowlist: Vec<String>,
    /// Rule directory for scan-all jobs
    pub all_rules_dir: Option<PathBuf>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("nuclei"),
            extra_args: Vec::new(),
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            all_rules_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObjectStoreSettings {
    pub root_dir: PathBuf,
}

impl Default for ObjectStoreSettings {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("scanfleet-objects"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotifierSettings {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    pub enabled: bool,
    pub bind: String,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: DEFAULT_RPC_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub format: LogFormat,
}

impl Settings {
    /// Load from the default file location and the process environment
    pub fn load() -> Result<Self, ConfigLoadError> {
        let (path, required) = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => (path, true),
            Err(_) => (DEFAULT_CONFIG_FILE.to_string(), false),
        };
        Self::load_from(&path, required)
    }

    pub fn load_from(path: &str, required: bool) -> Result<Self, ConfigLoadError> {
        let settings: Settings = config::Config::builder()
            .add_source(
                config::File::with_name(path)
                    .format(config::FileFormat::Toml)
                    .required(required),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("executor.extra_args")
                    .with_list_parse_key("executor.env_allowlist"),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        let fail = |msg: String| Err(ConfigLoadError::Validation(msg));

        if self.worker.max_concurrent_scans < 1 {
            return fail("worker.max_concurrent_scans must be at least 1".to_string());
        }
        if self.worker.shutdown_grace_secs > MAX_SHUTDOWN_GRACE.as_secs() {
            return fail(format!(
                "worker.shutdown_grace_secs must not exceed {}",
                MAX_SHUTDOWN_GRACE.as_secs()
            ));
        }
        if self.worker.scan_deadline_secs == 0 {
            return fail("worker.scan_deadline_secs must be positive".to_string());
        }
        if !(0.0..=100.0).contains(&self.worker.memory_threshold_percent) {
            return fail("worker.memory_threshold_percent must be within 0..=100".to_string());
        }
        if self.worker.retry.enabled && self.worker.retry.max_attempts < 1 {
            return fail("worker.retry.max_attempts must be at least 1".to_string());
        }
        if self.queue.visibility_timeout_secs <= self.worker.scan_deadline_secs {
            return fail(
                "queue.visibility_timeout_secs must exceed worker.scan_deadline_secs".to_string(),
            );
        }
        if self.queue.reconnect_attempts < 1 {
            return fail("queue.reconnect_attempts must be at least 1".to_string());
        }
        if self.scheduler.interval_secs == 0 {
            return fail("scheduler.interval_secs must be positive".to_string());
        }
        Ok(())
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let retry = if self.worker.retry.enabled {
            JobRetryPolicy::enabled(self.worker.retry.max_attempts, self.worker.retry.base_delay_ms)
        } else {
            JobRetryPolicy::default()
        };

        DispatcherConfig {
            max_concurrent_scans: self.worker.max_concurrent_scans,
            mode: self.worker.mode,
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            shutdown_grace: Duration::from_secs(self.worker.shutdown_grace_secs),
            retry,
            memory_threshold_percent: self.worker.memory_threshold_percent,
        }
    }

    pub fn scan_deadline(&self) -> Duration {
        Duration::from_secs(self.worker.scan_deadline_secs)
    }

    pub fn stale_batch_timeout(&self) -> Option<Duration> {
        self.scheduler.stale_batch_timeout_secs.map(Duration::from_secs)
    }
}
